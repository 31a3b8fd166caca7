use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use broadside::domain::reminder::{Registration, TicketId, TicketReminder};
use broadside::domain::template::{Channel, MessageTemplate, TemplateId};
use broadside::{MemoryStore, MockMailer, ReminderConfig, ReminderSweep};

fn reminder_template() -> MessageTemplate {
    MessageTemplate {
        id: TemplateId::from(Uuid::new_v4()),
        name: "check-in-reminder".to_string(),
        channel: Channel::Email,
        subject: Some("See you at {{eventName}}".to_string()),
        body: "Hi {{name}}, you have not checked in for {{eventName}} yet.".to_string(),
        attachments: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn ticket(name: &str, ends_in: Duration) -> TicketReminder {
    TicketReminder {
        ticket_id: TicketId::from(Uuid::new_v4()),
        ticket_name: name.to_string(),
        event_name: format!("{} Event", name),
        event_ends_at: Utc::now() + ends_in,
        reminders_enabled: true,
    }
}

fn registration(email: &str, age: Duration, approved: bool, checked_in: bool) -> Registration {
    Registration {
        email: email.to_string(),
        name: email.split('@').next().unwrap_or("").to_string(),
        contact: String::new(),
        approved,
        checked_in_at: checked_in.then(Utc::now),
        created_at: Utc::now() - age,
    }
}

fn sweep(
    store: &Arc<MemoryStore>,
    mailer: &Arc<MockMailer>,
    config: ReminderConfig,
) -> ReminderSweep<MemoryStore, MockMailer> {
    ReminderSweep::new(store.clone(), mailer.clone(), config, CancellationToken::new())
}

fn fast_config() -> ReminderConfig {
    ReminderConfig {
        batch_size: 100,
        batch_delay_ms: 1,
        ..Default::default()
    }
}

#[test_log::test(tokio::test)]
async fn sweep_targets_only_eligible_registrations() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(MockMailer::new());

    let active = ticket("VIP", Duration::days(7));
    let active_id = active.ticket_id;
    store.insert_ticket(active);
    store.insert_reminder_template(active_id, Channel::Email, reminder_template());

    // Only the first registration qualifies.
    store.insert_registration(active_id, registration("old@example.com", Duration::days(3), true, false));
    store.insert_registration(active_id, registration("fresh@example.com", Duration::hours(2), true, false));
    store.insert_registration(active_id, registration("arrived@example.com", Duration::days(3), true, true));
    store.insert_registration(active_id, registration("unapproved@example.com", Duration::days(3), false, false));

    // An ended event is skipped wholesale, eligible registrations or not.
    let ended = ticket("Expired", Duration::days(-1));
    let ended_id = ended.ticket_id;
    store.insert_ticket(ended);
    store.insert_reminder_template(ended_id, Channel::Email, reminder_template());
    store.insert_registration(ended_id, registration("late@example.com", Duration::days(3), true, false));

    // No template configured: the ticket is skipped.
    let untemplated = ticket("NoTemplate", Duration::days(7));
    let untemplated_id = untemplated.ticket_id;
    store.insert_ticket(untemplated);
    store.insert_registration(untemplated_id, registration("quiet@example.com", Duration::days(3), true, false));

    let stats = sweep(&store, &mailer, fast_config()).sweep_once().await.unwrap();

    assert_eq!(stats.tickets_swept, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 0);

    let calls = mailer.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].to, "old@example.com");
    assert_eq!(calls[0].subject, "See you at VIP Event");
    assert!(calls[0].html.contains("VIP Event"));
}

#[test_log::test(tokio::test)]
async fn sweep_chunks_large_ticket_lists() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(MockMailer::new());

    let active = ticket("General", Duration::days(7));
    let ticket_id = active.ticket_id;
    store.insert_ticket(active);
    store.insert_reminder_template(ticket_id, Channel::Email, reminder_template());
    for i in 0..5 {
        store.insert_registration(
            ticket_id,
            registration(&format!("user{}@example.com", i), Duration::days(2), true, false),
        );
    }

    let config = ReminderConfig {
        batch_size: 2,
        ..fast_config()
    };
    let stats = sweep(&store, &mailer, config).sweep_once().await.unwrap();

    assert_eq!(stats.sent, 5);
    assert_eq!(mailer.call_count(), 5);
}

#[test_log::test(tokio::test)]
async fn sweep_counts_failures_without_stopping() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(MockMailer::new());
    mailer.fail_address("user1@example.com");

    let active = ticket("General", Duration::days(7));
    let ticket_id = active.ticket_id;
    store.insert_ticket(active);
    store.insert_reminder_template(ticket_id, Channel::Email, reminder_template());
    for i in 0..3 {
        store.insert_registration(
            ticket_id,
            registration(&format!("user{}@example.com", i), Duration::days(2), true, false),
        );
    }

    let stats = sweep(&store, &mailer, fast_config()).sweep_once().await.unwrap();

    assert_eq!(stats.sent, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(mailer.call_count(), 3);
}

#[test_log::test(tokio::test)]
async fn sweep_with_nothing_to_do_is_a_no_op() {
    let store = Arc::new(MemoryStore::new());
    let mailer = Arc::new(MockMailer::new());

    let stats = sweep(&store, &mailer, fast_config()).sweep_once().await.unwrap();

    assert_eq!(stats, broadside::SweepStats::default());
    assert_eq!(mailer.call_count(), 0);
}
