//! Access-control reconciler — reacts to payment-confirmed events.
//!
//! When a payment lands, the invoice is marked paid locally and the owning
//! customer's overdue count is recomputed against the configured threshold.
//! Below it, a customer currently flagged blocked gets unblocked on the
//! access-control platform, the local mirror is updated, and a best-effort
//! notification goes out. Access-control or notification failures never roll
//! back the invoice update that already happened.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::clients::evolution::is_dispatchable_phone;
use crate::clients::{AccessControl, Messenger};
use crate::config::Settings;
use crate::error::Error;
use crate::model::{Category, InvoiceStatus};
use crate::store::Storage;

/// Sent after a successful unblock.
const UNBLOCKED_MESSAGE: &str =
    "Pagamento confirmado! Seu acesso foi reativado. Obrigado.";

pub struct Reconciler {
    store: Arc<dyn Storage>,
    access: Arc<dyn AccessControl>,
    messenger: Arc<dyn Messenger>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Storage>,
        access: Arc<dyn AccessControl>,
        messenger: Arc<dyn Messenger>,
    ) -> Self {
        Self {
            store,
            access,
            messenger,
        }
    }

    /// Wire the real clients from the current settings, choosing the auth
    /// scheme the access-control platform is configured for.
    pub fn from_settings(store: Arc<dyn Storage>, settings: &Settings) -> Self {
        use crate::clients::traccar::AuthScheme;
        use crate::config::TraccarAuthMode;
        use secrecy::SecretString;

        let auth: Box<dyn AuthScheme> = match settings.traccar_auth {
            TraccarAuthMode::Bearer => Box::new(crate::clients::BearerAuth::new(
                SecretString::from(settings.traccar_token.clone()),
            )),
            TraccarAuthMode::Session => Box::new(crate::clients::SessionAuth::new(
                settings.traccar_user.clone(),
                SecretString::from(settings.traccar_password.clone()),
            )),
        };
        let access = Arc::new(crate::clients::TraccarClient::new(&settings.traccar_url, auth));
        let messenger = Arc::new(crate::clients::EvolutionClient::new(
            &settings.messenger_url,
            SecretString::from(settings.messenger_key.clone()),
            &settings.messenger_instance,
        ));
        Self::new(store, access, messenger)
    }

    /// Handle one payment-confirmed event for `invoice_id`.
    pub async fn on_payment_confirmed(
        &self,
        invoice_id: &str,
        settings: &Settings,
    ) -> Result<(), Error> {
        let Some(invoice) = self
            .store
            .get_invoice(invoice_id)
            .await
            .map_err(Error::Database)?
        else {
            warn!(invoice = invoice_id, "Payment confirmed for unknown invoice");
            return Ok(());
        };

        // The payment is a fact; apply it before anything that can fail.
        self.store
            .set_invoice_status(invoice_id, InvoiceStatus::Received)
            .await
            .map_err(Error::Database)?;
        self.store
            .set_invoice_category(invoice_id, Category::Processada)
            .await
            .map_err(Error::Database)?;
        info!(invoice = invoice_id, customer = %invoice.customer_id, "Payment applied");

        let overdue = self
            .store
            .count_overdue_for_customer(&invoice.customer_id)
            .await
            .map_err(Error::Database)?;

        let Some(client) = self
            .store
            .get_client_by_external_id(&invoice.customer_id)
            .await
            .map_err(Error::Database)?
        else {
            return Ok(());
        };

        if overdue >= settings.overdue_block_threshold || !client.is_traccar_blocked {
            return Ok(());
        }

        let Some(user_id) = client.traccar_user_id else {
            warn!(
                customer = %client.external_id,
                "Customer flagged blocked but has no access-control mapping"
            );
            return Ok(());
        };

        match self.access.unblock_user(user_id).await {
            Ok(()) => {
                self.store
                    .set_client_blocked(&client.external_id, false)
                    .await
                    .map_err(Error::Database)?;
                info!(
                    customer = %client.external_id,
                    user = user_id,
                    overdue,
                    "Customer unblocked"
                );

                // Best effort; a notification failure never undoes the unblock.
                if let Some(phone) = client.phone.as_deref()
                    && is_dispatchable_phone(phone)
                    && let Err(e) = self.messenger.send_text(phone, UNBLOCKED_MESSAGE).await
                {
                    warn!(
                        customer = %client.external_id,
                        error = %e,
                        "Unblock notification failed"
                    );
                }
            }
            Err(e) => {
                // The invoice update stays applied; block state is retried on
                // the next confirmed payment.
                error!(
                    customer = %client.external_id,
                    user = user_id,
                    error = %e,
                    "Access-control unblock failed"
                );
            }
        }

        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::evolution::InstanceStatus;
    use crate::clients::TraccarUser;
    use crate::error::{AccessError, MessengerError};
    use crate::model::{ClientData, Invoice};
    use crate::store::LibSqlBackend;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockAccess {
        unblocks: AtomicUsize,
        blocks: AtomicUsize,
        fail: bool,
    }

    impl MockAccess {
        fn new(fail: bool) -> Self {
            Self {
                unblocks: AtomicUsize::new(0),
                blocks: AtomicUsize::new(0),
                fail,
            }
        }
    }

    #[async_trait]
    impl AccessControl for MockAccess {
        async fn get_users(&self) -> Result<Vec<TraccarUser>, AccessError> {
            Ok(vec![])
        }

        async fn get_user_by_id(&self, id: i64) -> Result<TraccarUser, AccessError> {
            Err(AccessError::UserNotFound {
                query: format!("id={id}"),
            })
        }

        async fn get_user_by_email(
            &self,
            _email: &str,
        ) -> Result<Option<TraccarUser>, AccessError> {
            Ok(None)
        }

        async fn get_user_by_phone(
            &self,
            _phone: &str,
        ) -> Result<Option<TraccarUser>, AccessError> {
            Ok(None)
        }

        async fn block_user(&self, _id: i64) -> Result<(), AccessError> {
            self.blocks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn unblock_user(&self, _id: i64) -> Result<(), AccessError> {
            if self.fail {
                return Err(AccessError::RequestFailed {
                    endpoint: "/api/users".into(),
                    reason: "unreachable".into(),
                });
            }
            self.unblocks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct MockMessenger {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Messenger for MockMessenger {
        async fn send_text(&self, phone: &str, _message: &str) -> Result<bool, MessengerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MessengerError::SendFailed {
                    phone: phone.to_string(),
                    reason: "down".into(),
                });
            }
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

    fn settings() -> Settings {
        Settings {
            overdue_block_threshold: 2,
            ..Settings::default()
        }
    }

    fn invoice(id: &str, status: InvoiceStatus) -> Invoice {
        Invoice {
            id: id.into(),
            customer_id: "cus_1".into(),
            customer_name: "Maria".into(),
            customer_phone: "11987654321".into(),
            value: dec!(100.00),
            due_date: NaiveDate::from_ymd_opt(2026, 8, 1).unwrap(),
            status,
            invoice_url: String::new(),
            description: None,
            category: Some(Category::Atraso),
        }
    }

    /// Store with one blocked, mapped customer and `extra_overdue` other
    /// overdue invoices besides `pay_main`.
    async fn setup(extra_overdue: usize) -> Arc<LibSqlBackend> {
        let store = Arc::new(LibSqlBackend::new_memory().await.unwrap());

        let mut client = ClientData::new("cus_1", "Maria", None, Some("11987654321".into()));
        client.traccar_user_id = Some(42);
        store.upsert_client(&client).await.unwrap();
        store.update_client_mapping("cus_1", Some(42), None).await.unwrap();
        store.set_client_blocked("cus_1", true).await.unwrap();

        store
            .upsert_invoice(&invoice("pay_main", InvoiceStatus::Overdue))
            .await
            .unwrap();
        for i in 0..extra_overdue {
            store
                .upsert_invoice(&invoice(&format!("pay_extra_{i}"), InvoiceStatus::Overdue))
                .await
                .unwrap();
        }

        store
    }

    #[tokio::test]
    async fn payment_marks_invoice_paid_and_unblocks_below_threshold() {
        let store = setup(0).await;
        let access = Arc::new(MockAccess::new(false));
        let messenger = Arc::new(MockMessenger {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let reconciler = Reconciler::new(store.clone(), access.clone(), messenger.clone());
        reconciler
            .on_payment_confirmed("pay_main", &settings())
            .await
            .unwrap();

        let inv = store.get_invoice("pay_main").await.unwrap().unwrap();
        assert_eq!(inv.status, InvoiceStatus::Received);
        assert_eq!(inv.category, Some(Category::Processada));

        assert_eq!(access.unblocks.load(Ordering::SeqCst), 1);
        let client = store.get_client_by_external_id("cus_1").await.unwrap().unwrap();
        assert!(!client.is_traccar_blocked);

        // Unblock notification went out.
        assert_eq!(messenger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn at_threshold_no_unblock_happens() {
        // pay_main plus two extras; after paying pay_main, 2 remain overdue,
        // which meets the threshold of 2.
        let store = setup(2).await;
        let access = Arc::new(MockAccess::new(false));
        let messenger = Arc::new(MockMessenger {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let reconciler = Reconciler::new(store.clone(), access.clone(), messenger);
        reconciler
            .on_payment_confirmed("pay_main", &settings())
            .await
            .unwrap();

        let inv = store.get_invoice("pay_main").await.unwrap().unwrap();
        assert_eq!(inv.status, InvoiceStatus::Received);

        assert_eq!(access.unblocks.load(Ordering::SeqCst), 0);
        let client = store.get_client_by_external_id("cus_1").await.unwrap().unwrap();
        assert!(client.is_traccar_blocked);
    }

    #[tokio::test]
    async fn already_unblocked_customer_is_left_alone() {
        let store = setup(0).await;
        store.set_client_blocked("cus_1", false).await.unwrap();
        let access = Arc::new(MockAccess::new(false));
        let messenger = Arc::new(MockMessenger {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let reconciler = Reconciler::new(store.clone(), access.clone(), messenger);
        reconciler
            .on_payment_confirmed("pay_main", &settings())
            .await
            .unwrap();

        assert_eq!(access.unblocks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn access_failure_keeps_invoice_update_and_block_state() {
        let store = setup(0).await;
        let access = Arc::new(MockAccess::new(true));
        let messenger = Arc::new(MockMessenger {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let reconciler = Reconciler::new(store.clone(), access, messenger.clone());
        // Does not propagate the access error.
        reconciler
            .on_payment_confirmed("pay_main", &settings())
            .await
            .unwrap();

        let inv = store.get_invoice("pay_main").await.unwrap().unwrap();
        assert_eq!(inv.status, InvoiceStatus::Received);

        // Mirror untouched: the external call never succeeded.
        let client = store.get_client_by_external_id("cus_1").await.unwrap().unwrap();
        assert!(client.is_traccar_blocked);

        // No notification either.
        assert_eq!(messenger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn notification_failure_does_not_undo_the_unblock() {
        let store = setup(0).await;
        let access = Arc::new(MockAccess::new(false));
        let messenger = Arc::new(MockMessenger {
            calls: AtomicUsize::new(0),
            fail: true,
        });

        let reconciler = Reconciler::new(store.clone(), access.clone(), messenger.clone());
        reconciler
            .on_payment_confirmed("pay_main", &settings())
            .await
            .unwrap();

        assert_eq!(access.unblocks.load(Ordering::SeqCst), 1);
        assert_eq!(messenger.calls.load(Ordering::SeqCst), 1);
        let client = store.get_client_by_external_id("cus_1").await.unwrap().unwrap();
        assert!(!client.is_traccar_blocked);
    }

    #[tokio::test]
    async fn unknown_invoice_is_ignored() {
        let store = setup(0).await;
        let access = Arc::new(MockAccess::new(false));
        let messenger = Arc::new(MockMessenger {
            calls: AtomicUsize::new(0),
            fail: false,
        });

        let reconciler = Reconciler::new(store, access.clone(), messenger);
        reconciler
            .on_payment_confirmed("pay_ghost", &settings())
            .await
            .unwrap();
        assert_eq!(access.unblocks.load(Ordering::SeqCst), 0);
    }
}
