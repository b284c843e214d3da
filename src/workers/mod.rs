pub mod installment_sweep;
pub mod reconciliation;
