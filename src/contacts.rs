//! Contact source reader: uploaded tabular files to recipient records.
//!
//! The reader accepts case-insensitive header variants for the email, name,
//! and contact columns, copies every other column through unchanged (in file
//! order), and drops any row without a usable email value. A structurally
//! valid file with no usable rows yields an empty list rather than an error;
//! the caller treats zero contacts as a creation-time validation failure.

use serde_json::{Map, Value};

use crate::error::Result;

/// Header spellings accepted for the email column.
const EMAIL_HEADERS: &[&str] = &["email", "e-mail", "email address", "emailaddress", "mail"];
/// Header spellings accepted for the name column.
const NAME_HEADERS: &[&str] = &["name", "full name", "fullname", "full_name"];
/// Header spellings accepted for the contact (phone) column.
const CONTACT_HEADERS: &[&str] = &["contact", "phone", "mobile", "phone number", "contact number"];

/// One recipient row from an uploaded contact file.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ContactRecord {
    pub email: String,
    pub name: String,
    pub contact: String,
    /// Remaining columns, in file order.
    pub extra: Vec<(String, String)>,
}

impl ContactRecord {
    /// Build the per-recipient rendering context.
    ///
    /// Extra columns are merged first so the fixed keys and the campaign
    /// context (`eventName`, `campaignName`) win collisions.
    pub fn render_context(&self, base: &Map<String, Value>) -> Value {
        let mut ctx = Map::new();
        for (key, value) in &self.extra {
            ctx.insert(key.clone(), Value::String(value.clone()));
        }
        ctx.insert("name".to_string(), Value::String(self.name.clone()));
        ctx.insert("email".to_string(), Value::String(self.email.clone()));
        ctx.insert("contact".to_string(), Value::String(self.contact.clone()));
        for (key, value) in base {
            ctx.insert(key.clone(), value.clone());
        }
        Value::Object(ctx)
    }
}

/// Parse an uploaded contact file into recipient records.
pub fn read(bytes: &[u8]) -> Result<Vec<ContactRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes);

    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let headers = reader.headers()?.clone();

    let mut email_col = None;
    let mut name_col = None;
    let mut contact_col = None;
    for (index, header) in headers.iter().enumerate() {
        let key = header.trim().to_ascii_lowercase();
        if email_col.is_none() && EMAIL_HEADERS.contains(&key.as_str()) {
            email_col = Some(index);
        } else if name_col.is_none() && NAME_HEADERS.contains(&key.as_str()) {
            name_col = Some(index);
        } else if contact_col.is_none() && CONTACT_HEADERS.contains(&key.as_str()) {
            contact_col = Some(index);
        }
    }

    // No email column means no row can resolve an address.
    let Some(email_col) = email_col else {
        return Ok(Vec::new());
    };

    let mut contacts = Vec::new();
    for record in reader.records() {
        let record = record?;

        let email = record.get(email_col).unwrap_or("").trim();
        if email.is_empty() || !email.contains('@') {
            continue;
        }

        let field = |col: Option<usize>| {
            col.and_then(|i| record.get(i))
                .unwrap_or("")
                .trim()
                .to_string()
        };

        let mut extra = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            if index == email_col || Some(index) == name_col || Some(index) == contact_col {
                continue;
            }
            let value = record.get(index).unwrap_or("").trim();
            extra.push((header.trim().to_string(), value.to_string()));
        }

        contacts.push(ContactRecord {
            email: email.to_string(),
            name: field(name_col),
            contact: field(contact_col),
            extra,
        });
    }

    Ok(contacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reads_standard_headers() {
        let csv = "email,name,contact\nana@example.com,Ana,555-0100\nbob@example.com,Bob,555-0101\n";
        let contacts = read(csv.as_bytes()).unwrap();
        assert_eq!(contacts.len(), 2);
        assert_eq!(contacts[0].email, "ana@example.com");
        assert_eq!(contacts[0].name, "Ana");
        assert_eq!(contacts[1].contact, "555-0101");
    }

    #[test]
    fn header_matching_is_case_insensitive() {
        let csv = "E-Mail,Full Name,Phone\nana@example.com,Ana,555-0100\n";
        let contacts = read(csv.as_bytes()).unwrap();
        assert_eq!(contacts.len(), 1);
        assert_eq!(contacts[0].email, "ana@example.com");
        assert_eq!(contacts[0].name, "Ana");
        assert_eq!(contacts[0].contact, "555-0100");
    }

    #[test]
    fn rows_without_email_are_dropped() {
        let csv = "email,name\nana@example.com,Ana\n,NoAddress\nnot-an-address,Broken\nbob@example.com,Bob\n";
        let contacts = read(csv.as_bytes()).unwrap();
        let emails: Vec<_> = contacts.iter().map(|c| c.email.as_str()).collect();
        assert_eq!(emails, ["ana@example.com", "bob@example.com"]);
    }

    #[test]
    fn extra_columns_pass_through_in_order() {
        let csv = "company,email,seat,name\nAcme,ana@example.com,A12,Ana\n";
        let contacts = read(csv.as_bytes()).unwrap();
        assert_eq!(
            contacts[0].extra,
            vec![
                ("company".to_string(), "Acme".to_string()),
                ("seat".to_string(), "A12".to_string()),
            ]
        );
    }

    #[test]
    fn empty_or_headerless_input_yields_empty_list() {
        assert!(read(b"").unwrap().is_empty());
        assert!(read(b"email,name\n").unwrap().is_empty());
        assert!(read(b"foo,bar\n1,2\n").unwrap().is_empty());
    }

    #[test]
    fn render_context_merges_base_over_extras() {
        let record = ContactRecord {
            email: "ana@example.com".to_string(),
            name: "Ana".to_string(),
            contact: String::new(),
            extra: vec![
                ("company".to_string(), "Acme".to_string()),
                ("eventName".to_string(), "stale".to_string()),
            ],
        };
        let mut base = Map::new();
        base.insert("eventName".to_string(), json!("ExpoTech"));
        let ctx = record.render_context(&base);
        assert_eq!(ctx["name"], json!("Ana"));
        assert_eq!(ctx["company"], json!("Acme"));
        assert_eq!(ctx["eventName"], json!("ExpoTech"));
    }
}
