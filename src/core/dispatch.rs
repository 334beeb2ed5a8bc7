//! Batched dispatch pipeline.
//!
//! Takes categorized invoices and pushes reminders through the messenger in
//! fixed-size batches: sequential between batches (with a pause to respect
//! the gateway's rate limits), concurrent within a batch, results collected
//! by index so the log order stays deterministic. One invoice's failure
//! never touches its siblings.
//!
//! Throttle state lives in storage: one send per invoice per calendar day,
//! and consecutive overdue reminders to the same customer spaced at least
//! the customer's configured interval apart. The throttle checks and writes
//! are not serialized against each other — two overdue invoices of the same
//! customer landing in one batch can both pass the check before either
//! records a send. Accepted at-least-once behavior, not a bug to lock away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use futures::future::join_all;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::evolution::{digits_only, is_dispatchable_phone};
use crate::clients::Messenger;
use crate::config::Settings;
use crate::core::render::render;
use crate::model::client::DEFAULT_OVERDUE_INTERVAL_DAYS;
use crate::model::{Category, ClientData, ExecutionLog, Invoice};
use crate::store::Storage;

/// Invoices dispatched concurrently per batch.
pub const BATCH_SIZE: usize = 10;

/// Pause between batches. Backpressure against the gateway, not a
/// correctness requirement.
pub const BATCH_PAUSE: Duration = Duration::from_secs(2);

/// Per-customer overdue aggregates, grouped by phone digits. Used only for
/// message variables; throttle decisions key on the customer id.
#[derive(Debug, Clone, Copy, Default)]
struct OverdueGroup {
    count: usize,
    total: Decimal,
}

/// The dispatch pipeline.
pub struct Dispatcher {
    store: Arc<dyn Storage>,
    messenger: Arc<dyn Messenger>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn Storage>, messenger: Arc<dyn Messenger>) -> Self {
        Self { store, messenger }
    }

    /// Run the pipeline over categorized invoices.
    ///
    /// Every produced log entry is appended to storage and, when a progress
    /// sender is given, forwarded on it. A closed progress channel is logged
    /// and ignored.
    pub async fn process(
        &self,
        execution_id: Uuid,
        invoices: &[Invoice],
        settings: &Settings,
        clients: &HashMap<String, ClientData>,
        today: NaiveDate,
        progress: Option<&mpsc::UnboundedSender<ExecutionLog>>,
    ) -> Vec<ExecutionLog> {
        let candidates: Vec<&Invoice> = invoices
            .iter()
            .filter(|i| i.category_or_default().is_actionable())
            .collect();

        // Overdue aggregates over the whole candidate set, including the
        // invoice being rendered.
        let overdue_groups = group_overdue_by_phone(&candidates);

        info!(
            candidates = candidates.len(),
            batches = candidates.len().div_ceil(BATCH_SIZE),
            "Dispatch pipeline starting"
        );

        let mut logs = Vec::with_capacity(candidates.len());
        let mut batches = candidates.chunks(BATCH_SIZE).peekable();

        while let Some(batch) = batches.next() {
            let futures = batch.iter().map(|invoice| {
                self.dispatch_one(execution_id, invoice, settings, clients, &overdue_groups, today)
            });

            // join_all keeps results in input order, so logs stay
            // deterministic regardless of which send finishes first.
            for log in join_all(futures).await {
                if let Err(e) = self.store.append_log(&log).await {
                    warn!(error = %e, invoice = %log.invoice_id, "Failed to persist log entry");
                }
                if let Some(tx) = progress
                    && tx.send(log.clone()).is_err()
                {
                    debug!("Progress channel closed; continuing without live updates");
                }
                logs.push(log);
            }

            if batches.peek().is_some() {
                tokio::time::sleep(BATCH_PAUSE).await;
            }
        }

        logs
    }

    /// Process one invoice: throttle checks, render, send, record.
    /// Always yields a log entry; short-circuits produce `error` entries
    /// without touching the messenger.
    async fn dispatch_one(
        &self,
        execution_id: Uuid,
        invoice: &Invoice,
        settings: &Settings,
        clients: &HashMap<String, ClientData>,
        overdue_groups: &HashMap<String, OverdueGroup>,
        today: NaiveDate,
    ) -> ExecutionLog {
        let category = invoice.category_or_default();
        let client = clients.get(&invoice.customer_id);

        // a. One send per invoice per calendar day.
        match self.store.invoice_last_sent(&invoice.id).await {
            Ok(Some(last)) if last == today => {
                return ExecutionLog::error(
                    execution_id,
                    invoice,
                    category,
                    "message already sent today",
                );
            }
            Ok(_) => {}
            Err(e) => {
                return ExecutionLog::error(
                    execution_id,
                    invoice,
                    category,
                    format!("throttle lookup failed: {e}"),
                );
            }
        }

        if category == Category::Atraso {
            // b. Customer opted out of overdue reminders.
            if client.is_some_and(|c| c.block_daily_messages) {
                return ExecutionLog::error(
                    execution_id,
                    invoice,
                    category,
                    "customer opted out of daily reminders",
                );
            }

            // c. Space consecutive overdue reminders.
            let interval = client
                .map(|c| c.overdue_notice_interval_days)
                .unwrap_or(DEFAULT_OVERDUE_INTERVAL_DAYS);
            match self.store.last_overdue_send(&invoice.customer_id).await {
                Ok(Some(last)) => {
                    let elapsed = (today - last).num_days();
                    if elapsed < interval {
                        let remaining = interval - elapsed;
                        return ExecutionLog::error(
                            execution_id,
                            invoice,
                            category,
                            format!("waiting {remaining} more day(s) before next overdue reminder"),
                        );
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    return ExecutionLog::error(
                        execution_id,
                        invoice,
                        category,
                        format!("throttle lookup failed: {e}"),
                    );
                }
            }
        }

        // d. A dispatchable phone needs at least ten digits.
        if !is_dispatchable_phone(&invoice.customer_phone) {
            return ExecutionLog::error(execution_id, invoice, category, "invalid phone number");
        }

        // Render with the category's template.
        let (template, overdue_count, overdue_total) = match category {
            Category::VenceHoje => (settings.templates.due_today.as_str(), None, None),
            Category::Aviso => (settings.templates.upcoming.as_str(), None, None),
            Category::Atraso => {
                let group = overdue_groups
                    .get(&digits_only(&invoice.customer_phone))
                    .copied()
                    .unwrap_or_default();
                (
                    settings.templates.overdue.as_str(),
                    Some(group.count),
                    Some(group.total),
                )
            }
            Category::Processada => unreachable!("non-actionable invoices are filtered out"),
        };
        let message = render(
            invoice,
            template,
            settings.notice_days_ahead,
            overdue_count,
            overdue_total,
        );

        match self.messenger.send_text(&invoice.customer_phone, &message).await {
            Ok(_) => {
                if let Err(e) = self.store.record_invoice_sent(&invoice.id, today).await {
                    warn!(error = %e, invoice = %invoice.id, "Failed to record invoice throttle");
                }
                if category == Category::Atraso
                    && let Err(e) = self
                        .store
                        .record_overdue_send(&invoice.customer_id, today)
                        .await
                {
                    warn!(error = %e, customer = %invoice.customer_id, "Failed to record overdue throttle");
                }
                ExecutionLog::success(execution_id, invoice, category, message)
            }
            Err(e) => ExecutionLog::error(execution_id, invoice, category, e.to_string()),
        }
    }
}

/// Aggregate overdue candidates by phone digits → (count, summed value).
fn group_overdue_by_phone(candidates: &[&Invoice]) -> HashMap<String, OverdueGroup> {
    let mut groups: HashMap<String, OverdueGroup> = HashMap::new();
    for invoice in candidates {
        if invoice.category_or_default() != Category::Atraso {
            continue;
        }
        let key = digits_only(&invoice.customer_phone);
        if key.is_empty() {
            continue;
        }
        let group = groups.entry(key).or_default();
        group.count += 1;
        group.total += invoice.value;
    }
    groups
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::evolution::InstanceStatus;
    use crate::error::MessengerError;
    use crate::model::{InvoiceStatus, LogOutcome};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Messenger double that records every send and can be told to fail.
    struct MockMessenger {
        sent: Mutex<Vec<(String, String)>>,
        calls: AtomicUsize,
        fail_phones: Vec<String>,
    }

    impl MockMessenger {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_phones: Vec::new(),
            }
        }

        fn failing_for(phones: &[&str]) -> Self {
            Self {
                fail_phones: phones.iter().map(|p| p.to_string()).collect(),
                ..Self::new()
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        async fn send_text(&self, phone: &str, message: &str) -> Result<bool, MessengerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_phones.iter().any(|p| p == phone) {
                return Err(MessengerError::SendFailed {
                    phone: phone.to_string(),
                    reason: "gateway exploded".to_string(),
                });
            }
            self.sent
                .lock()
                .await
                .push((phone.to_string(), message.to_string()));
            Ok(true)
        }

        async fn instance_status(&self) -> Result<InstanceStatus, MessengerError> {
            Ok(InstanceStatus {
                status: "open".into(),
                connected: true,
                phone: None,
            })
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 8).unwrap()
    }

    fn settings() -> Settings {
        Settings {
            provider_token: "tok".into(),
            messenger_url: "http://gw".into(),
            messenger_key: "key".into(),
            messenger_instance: "main".into(),
            ..Settings::default()
        }
    }

    fn invoice(id: &str, customer: &str, phone: &str, category: Category) -> Invoice {
        Invoice {
            id: id.into(),
            customer_id: customer.into(),
            customer_name: "Maria".into(),
            customer_phone: phone.into(),
            value: dec!(150.00),
            due_date: today(),
            status: InvoiceStatus::Pending,
            invoice_url: "https://pay.example/x".into(),
            description: None,
            category: Some(category),
        }
    }

    async fn setup() -> (Arc<LibSqlBackend>, Uuid) {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let exec = crate::model::Execution::started();
        store.create_execution(&exec).await.unwrap();
        (store, exec.id)
    }

    fn client(external_id: &str) -> ClientData {
        ClientData::new(external_id, "Maria", None, Some("11987654321".into()))
    }

    #[tokio::test]
    async fn processada_invoices_are_skipped_silently() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::Processada)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), None)
            .await;

        assert!(logs.is_empty());
        assert_eq!(messenger.call_count(), 0);
    }

    #[tokio::test]
    async fn due_today_invoice_is_sent_and_throttled() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::VenceHoje)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), None)
            .await;

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, LogOutcome::Success);
        assert_eq!(messenger.call_count(), 1);
        assert_eq!(store.invoice_last_sent("p1").await.unwrap(), Some(today()));

        let sent = messenger.sent.lock().await;
        assert!(sent[0].1.contains("R$ 150,00"));
        assert!(sent[0].1.contains("vence hoje"));
    }

    #[tokio::test]
    async fn already_sent_today_never_reaches_the_messenger() {
        let (store, exec_id) = setup().await;
        store.record_invoice_sent("p1", today()).await.unwrap();

        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::VenceHoje)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), None)
            .await;

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, LogOutcome::Error);
        assert_eq!(logs[0].detail.as_deref(), Some("message already sent today"));
        assert_eq!(messenger.call_count(), 0);
    }

    #[tokio::test]
    async fn sent_yesterday_goes_out_again_today() {
        let (store, exec_id) = setup().await;
        let yesterday = today().pred_opt().unwrap();
        store.record_invoice_sent("p1", yesterday).await.unwrap();

        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::VenceHoje)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), None)
            .await;

        assert_eq!(logs[0].outcome, LogOutcome::Success);
        assert_eq!(messenger.call_count(), 1);
    }

    #[tokio::test]
    async fn opted_out_customer_is_skipped_for_overdue() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let mut c = client("cus_1");
        c.block_daily_messages = true;
        let clients = HashMap::from([("cus_1".to_string(), c)]);

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::Atraso)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &clients, today(), None)
            .await;

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, LogOutcome::Error);
        assert_eq!(
            logs[0].detail.as_deref(),
            Some("customer opted out of daily reminders")
        );
        assert_eq!(messenger.call_count(), 0);
    }

    #[tokio::test]
    async fn opt_out_does_not_affect_due_today_reminders() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let mut c = client("cus_1");
        c.block_daily_messages = true;
        let clients = HashMap::from([("cus_1".to_string(), c)]);

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::VenceHoje)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &clients, today(), None)
            .await;

        assert_eq!(logs[0].outcome, LogOutcome::Success);
        assert_eq!(messenger.call_count(), 1);
    }

    #[tokio::test]
    async fn overdue_reminder_respects_customer_interval() {
        let (store, exec_id) = setup().await;
        // Last overdue reminder went out yesterday; interval is 3 days.
        store
            .record_overdue_send("cus_1", today().pred_opt().unwrap())
            .await
            .unwrap();

        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());
        let clients = HashMap::from([("cus_1".to_string(), client("cus_1"))]);

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::Atraso)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &clients, today(), None)
            .await;

        assert_eq!(logs[0].outcome, LogOutcome::Error);
        assert_eq!(
            logs[0].detail.as_deref(),
            Some("waiting 2 more day(s) before next overdue reminder")
        );
        assert_eq!(messenger.call_count(), 0);
    }

    #[tokio::test]
    async fn overdue_reminder_goes_out_after_interval_and_records_throttle() {
        let (store, exec_id) = setup().await;
        let three_days_ago = today() - chrono::Days::new(3);
        store.record_overdue_send("cus_1", three_days_ago).await.unwrap();

        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());
        let clients = HashMap::from([("cus_1".to_string(), client("cus_1"))]);

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::Atraso)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &clients, today(), None)
            .await;

        assert_eq!(logs[0].outcome, LogOutcome::Success);
        assert_eq!(store.last_overdue_send("cus_1").await.unwrap(), Some(today()));
        assert_eq!(store.invoice_last_sent("p1").await.unwrap(), Some(today()));
    }

    #[tokio::test]
    async fn invalid_phone_is_skipped() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let invoices = vec![invoice("p1", "cus_1", "987-654", Category::VenceHoje)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), None)
            .await;

        assert_eq!(logs[0].outcome, LogOutcome::Error);
        assert_eq!(logs[0].detail.as_deref(), Some("invalid phone number"));
        assert_eq!(messenger.call_count(), 0);
    }

    #[tokio::test]
    async fn send_failure_writes_no_throttle_and_spares_siblings() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::failing_for(&["11911112222"]));
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let invoices = vec![
            invoice("p1", "cus_1", "11911112222", Category::VenceHoje),
            invoice("p2", "cus_2", "11987654321", Category::VenceHoje),
        ];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), None)
            .await;

        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].outcome, LogOutcome::Error);
        assert!(logs[0].detail.as_deref().unwrap().contains("gateway exploded"));
        assert!(store.invoice_last_sent("p1").await.unwrap().is_none());

        assert_eq!(logs[1].outcome, LogOutcome::Success);
        assert_eq!(store.invoice_last_sent("p2").await.unwrap(), Some(today()));
    }

    #[tokio::test]
    async fn overdue_group_includes_the_rendered_invoice() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());
        let clients = HashMap::from([("cus_1".to_string(), client("cus_1"))]);

        // Three overdue invoices on the same phone: 150 + 250 + 250 = 650.
        let mut i1 = invoice("p1", "cus_1", "11987654321", Category::Atraso);
        i1.value = dec!(150.00);
        let mut i2 = invoice("p2", "cus_1", "11987654321", Category::Atraso);
        i2.value = dec!(250.00);
        let mut i3 = invoice("p3", "cus_1", "11987654321", Category::Atraso);
        i3.value = dec!(250.00);

        let logs = dispatcher
            .process(exec_id, &[i1, i2, i3], &settings(), &clients, today(), None)
            .await;

        // At least one goes out with the full group; siblings in the same
        // batch may race the customer-level throttle (accepted).
        let successes: Vec<_> = logs
            .iter()
            .filter(|l| l.outcome == LogOutcome::Success)
            .collect();
        assert!(!successes.is_empty());

        let sent = messenger.sent.lock().await;
        let message = &sent[0].1;
        assert!(message.contains("3 fatura(s)"), "got: {message}");
        assert!(message.contains("R$ 650,00"), "got: {message}");
    }

    #[tokio::test]
    async fn logs_are_persisted_and_streamed_in_order() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let invoices: Vec<Invoice> = (0..12)
            .map(|i| invoice(&format!("p{i}"), &format!("cus_{i}"), "11987654321", Category::VenceHoje))
            .collect();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), Some(&tx))
            .await;
        drop(tx);

        assert_eq!(logs.len(), 12);
        for (i, log) in logs.iter().enumerate() {
            assert_eq!(log.invoice_id, format!("p{i}"));
        }

        let stored = store.list_logs(exec_id).await.unwrap();
        assert_eq!(stored.len(), 12);
        assert_eq!(stored[0].invoice_id, "p0");
        assert_eq!(stored[11].invoice_id, "p11");

        let mut streamed = Vec::new();
        while let Ok(log) = rx.try_recv() {
            streamed.push(log.invoice_id);
        }
        assert_eq!(streamed.len(), 12);
        assert_eq!(streamed[0], "p0");
    }

    #[tokio::test]
    async fn closed_progress_channel_does_not_abort_the_pipeline() {
        let (store, exec_id) = setup().await;
        let messenger = Arc::new(MockMessenger::new());
        let dispatcher = Dispatcher::new(store.clone(), messenger.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);

        let invoices = vec![invoice("p1", "cus_1", "11987654321", Category::VenceHoje)];
        let logs = dispatcher
            .process(exec_id, &invoices, &settings(), &HashMap::new(), today(), Some(&tx))
            .await;

        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].outcome, LogOutcome::Success);
    }
}
