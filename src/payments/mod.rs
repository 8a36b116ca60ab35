pub mod error;
pub mod gateway;
pub mod http_gateway;
pub mod mock;
pub mod signature;
pub mod state;
pub mod types;
pub mod utils;

pub use error::{GatewayError, GatewayResult};
pub use gateway::PaymentGateway;
pub use http_gateway::{HttpGateway, HttpGatewayConfig};
pub use mock::InMemoryGateway;
pub use signature::WebhookVerifier;
pub use state::{check_transition, PaymentStatus, StatusChange, TransitionError};
