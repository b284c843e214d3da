pub mod error;
pub mod factory;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod signature;
pub mod types;
pub mod utils;

pub use error::{PaymentError, PaymentResult};
pub use factory::{GatewayFactory, PaymentFactoryConfig};
pub use provider::PaymentGateway;
pub use registry::{FeeSchedule, GatewayDefinition, GatewayRegistry};
pub use types::*;
