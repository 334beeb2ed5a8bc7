//! Clients for the three external systems: payments provider, messaging
//! channel, and access control. Each sits behind a trait so the processing
//! core can be driven by mocks in tests.

pub mod asaas;
pub mod evolution;
pub mod traccar;

pub use asaas::{AsaasClient, BillingProvider, ProviderCustomer};
pub use evolution::{EvolutionClient, InstanceStatus, Messenger};
pub use traccar::{AccessControl, BearerAuth, SessionAuth, TraccarClient, TraccarUser};
