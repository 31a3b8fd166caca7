use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use broadside::domain::campaign::{
    AnyCampaign, CampaignData, CampaignId, CampaignStatus, NewCampaign,
};
use broadside::domain::template::{Channel, MessageTemplate, TemplateId};
use broadside::{BroadsideError, Dispatcher, DispatcherConfig, MemoryStore, MockMailer, Storage};

fn email_template(id: TemplateId) -> MessageTemplate {
    MessageTemplate {
        id,
        name: "welcome".to_string(),
        channel: Channel::Email,
        subject: Some("Hello {{name}}".to_string()),
        body: "Welcome to {{eventName}}, {{name}}".to_string(),
        attachments: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn contact_csv(count: usize) -> Vec<u8> {
    let mut csv = String::from("email,name\n");
    for i in 0..count {
        csv.push_str(&format!("user{}@example.com,User {}\n", i, i));
    }
    csv.into_bytes()
}

/// Store seeded with one template and one contact file.
fn setup(contact_count: usize) -> (Arc<MemoryStore>, TemplateId) {
    let store = Arc::new(MemoryStore::new());
    let template_id = TemplateId::from(Uuid::new_v4());
    store.insert_template(email_template(template_id));
    store.insert_file("contacts.csv", contact_csv(contact_count));
    (store, template_id)
}

fn dispatcher(
    store: &Arc<MemoryStore>,
    mailer: &Arc<MockMailer>,
    config: DispatcherConfig,
) -> Dispatcher<MemoryStore, MockMailer> {
    Dispatcher::new(
        store.clone(),
        mailer.clone(),
        config,
        CancellationToken::new(),
    )
}

/// Fast inter-batch delay so multi-batch runs finish in milliseconds.
fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        batch_interval_unit_ms: 5,
        ..Default::default()
    }
}

fn new_campaign(template_id: TemplateId, batch_size: Option<u32>) -> NewCampaign {
    NewCampaign {
        name: "launch-announcement".to_string(),
        event_name: "ExpoTech".to_string(),
        template_id,
        contact_file: "contacts.csv".to_string(),
        scheduled: false,
        scheduled_at: None,
        batch_size,
        batch_interval_mins: Some(1),
    }
}

async fn wait_terminal(store: &MemoryStore, id: CampaignId) -> AnyCampaign {
    let start = tokio::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        let campaign = store.get_campaign(id).await.expect("campaign must exist");
        if campaign.is_terminal() {
            return campaign;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("campaign did not reach a terminal state within timeout");
}

#[test_log::test(tokio::test)]
async fn immediate_campaign_delivers_every_contact() {
    let (store, template_id) = setup(7);
    let mailer = Arc::new(MockMailer::new());
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let created = dispatcher
        .create_campaign(new_campaign(template_id, Some(3)))
        .await
        .expect("creation must succeed");

    let finished = wait_terminal(&store, created.id()).await;
    assert_eq!(finished.status(), CampaignStatus::Completed);

    let progress = finished.progress().expect("progress must exist");
    assert_eq!(progress.sent_count, 7);
    assert_eq!(progress.failed_count, 0);
    assert_eq!(progress.current_batch, 3);
    assert_eq!(mailer.call_count(), 7);

    // Personalized per recipient, in file order.
    let calls = mailer.calls();
    assert_eq!(calls[0].subject, "Hello User 0");
    assert_eq!(calls[0].html, "Welcome to ExpoTech, User 0");
    assert_eq!(calls[6].to, "user6@example.com");
}

#[test_log::test(tokio::test)]
async fn first_batch_of_250_runs_before_creation_returns() {
    let (store, template_id) = setup(250);
    let mailer = Arc::new(MockMailer::new());
    // Slow enough that the continuation cannot fire before we assert.
    let dispatcher = dispatcher(
        &store,
        &mailer,
        DispatcherConfig {
            batch_interval_unit_ms: 200,
            ..Default::default()
        },
    );

    let created = dispatcher
        .create_campaign(new_campaign(template_id, Some(100)))
        .await
        .expect("creation must succeed");

    // Immediate send: batch 0 ran synchronously.
    assert_eq!(created.data().total_batches(), 3);
    let progress = created.progress().expect("progress must exist");
    assert_eq!(progress.current_batch, 1);
    assert_eq!(progress.sent_count, 100);
    assert_eq!(mailer.call_count(), 100);

    // Remaining batches of 100 and 50 follow after the deferred delays.
    let finished = wait_terminal(&store, created.id()).await;
    assert_eq!(finished.status(), CampaignStatus::Completed);
    let progress = finished.progress().expect("progress must exist");
    assert_eq!(progress.sent_count, 250);
    assert_eq!(progress.current_batch, 3);
    assert_eq!(mailer.call_count(), 250);
}

#[test_log::test(tokio::test)]
async fn one_bad_recipient_does_not_abandon_the_batch() {
    let (store, template_id) = setup(5);
    let mailer = Arc::new(MockMailer::new());
    mailer.fail_address("user2@example.com");
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let created = dispatcher
        .create_campaign(new_campaign(template_id, Some(5)))
        .await
        .expect("creation must succeed");

    let finished = wait_terminal(&store, created.id()).await;
    // A run with any failure ends in `failed`; counters carry the split.
    assert_eq!(finished.status(), CampaignStatus::Failed);
    let progress = finished.progress().expect("progress must exist");
    assert_eq!(progress.sent_count, 4);
    assert_eq!(progress.failed_count, 1);
    assert!(finished.error().is_some());

    // Every recipient after the bad one was still attempted.
    assert_eq!(mailer.call_count(), 5);
}

#[test_log::test(tokio::test)]
async fn empty_contact_file_fails_creation() {
    let (store, template_id) = setup(0);
    let mailer = Arc::new(MockMailer::new());
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let result = dispatcher
        .create_campaign(new_campaign(template_id, None))
        .await;

    assert!(matches!(result, Err(BroadsideError::Validation(_))));
    assert_eq!(mailer.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn missing_template_fails_the_campaign_before_any_send() {
    let store = Arc::new(MemoryStore::new());
    store.insert_file("contacts.csv", contact_csv(3));
    let mailer = Arc::new(MockMailer::new());
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let created = dispatcher
        .create_campaign(new_campaign(TemplateId::from(Uuid::new_v4()), None))
        .await
        .expect("creation succeeds; the template is only read at batch time");

    let finished = wait_terminal(&store, created.id()).await;
    assert_eq!(finished.status(), CampaignStatus::Failed);
    assert_eq!(mailer.call_count(), 0);
}

#[test_log::test(tokio::test)]
async fn scheduled_campaign_does_not_run_before_its_time() {
    let (store, template_id) = setup(3);
    let mailer = Arc::new(MockMailer::new());
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let mut input = new_campaign(template_id, None);
    input.scheduled = true;
    input.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));

    let created = dispatcher
        .create_campaign(input)
        .await
        .expect("creation must succeed");
    assert_eq!(created.status(), CampaignStatus::Pending);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mailer.call_count(), 0);
    let campaign = store.get_campaign(created.id()).await.unwrap();
    assert_eq!(campaign.status(), CampaignStatus::Pending);
}

#[test_log::test(tokio::test)]
async fn restore_pending_fires_a_past_due_schedule() {
    let (store, template_id) = setup(4);
    let mailer = Arc::new(MockMailer::new());

    // Seed a campaign whose timer was lost to a restart.
    let id = CampaignId::from(Uuid::new_v4());
    store
        .create_campaign(CampaignData {
            id,
            name: "restored".to_string(),
            event_name: "ExpoTech".to_string(),
            template_id,
            contact_file: "contacts.csv".to_string(),
            total_contacts: 4,
            scheduled: true,
            scheduled_at: Some(Utc::now() - chrono::Duration::minutes(5)),
            batch_size: 10,
            batch_interval_mins: 1,
            created_at: Utc::now() - chrono::Duration::hours(1),
        })
        .await
        .expect("seeding must succeed");

    let dispatcher = dispatcher(&store, &mailer, fast_config());
    let restored = dispatcher.restore_pending().await.expect("restore must succeed");
    assert_eq!(restored, 1);

    let finished = wait_terminal(&store, id).await;
    assert_eq!(finished.status(), CampaignStatus::Completed);
    assert_eq!(mailer.call_count(), 4);
}

#[test_log::test(tokio::test)]
async fn a_started_campaign_is_not_started_twice() {
    let (store, template_id) = setup(3);
    let mailer = Arc::new(MockMailer::new());
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let mut input = new_campaign(template_id, None);
    input.scheduled = true;
    input.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
    let created = dispatcher.create_campaign(input).await.unwrap();
    let id = created.id();

    // Another starter wins the compare-and-swap first.
    assert!(store.begin_processing(id).await.unwrap());

    // This starter loses the race and must not send anything.
    dispatcher.execute(id).await.expect("losing the race is not an error");
    assert_eq!(mailer.call_count(), 0);
    let campaign = store.get_campaign(id).await.unwrap();
    assert_eq!(campaign.status(), CampaignStatus::Processing);
}

#[test_log::test(tokio::test)]
async fn send_now_overrides_a_future_schedule() {
    let (store, template_id) = setup(3);
    let mailer = Arc::new(MockMailer::new());
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let mut input = new_campaign(template_id, None);
    input.scheduled = true;
    input.scheduled_at = Some(Utc::now() + chrono::Duration::hours(1));
    let created = dispatcher.create_campaign(input).await.unwrap();

    dispatcher.send_now(created.id()).await.expect("send_now must succeed");

    let finished = wait_terminal(&store, created.id()).await;
    assert_eq!(finished.status(), CampaignStatus::Completed);
    assert_eq!(mailer.call_count(), 3);
}

#[test_log::test(tokio::test)]
async fn counters_never_exceed_total_contacts() {
    let (store, template_id) = setup(9);
    let mailer = Arc::new(MockMailer::new());
    mailer.fail_address("user1@example.com");
    mailer.fail_address("user5@example.com");
    let dispatcher = dispatcher(&store, &mailer, fast_config());

    let created = dispatcher
        .create_campaign(new_campaign(template_id, Some(4)))
        .await
        .unwrap();
    let total = created.data().total_contacts as u64;

    // The invariant holds at every observation point, not just at the end.
    let start = tokio::time::Instant::now();
    loop {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "campaign did not finish within timeout"
        );
        let campaign = store.get_campaign(created.id()).await.unwrap();
        if let Some(progress) = campaign.progress() {
            assert!(progress.sent_count + progress.failed_count <= total);
        }
        if campaign.is_terminal() {
            let progress = campaign.progress().unwrap();
            assert_eq!(progress.sent_count + progress.failed_count, total);
            assert_eq!(progress.failed_count, 2);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
