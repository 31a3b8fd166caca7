//! Domain types: campaigns and their lifecycle, message templates, and
//! reminder targets.

pub mod campaign;
pub mod reminder;
pub mod template;
pub mod transitions;
