pub mod bank_transfer;
pub mod cash;
pub mod momo;

pub use bank_transfer::{BankTransferConfig, BankTransferGateway};
pub use cash::CashGateway;
pub use momo::{MomoConfig, MomoGateway};
