pub mod approx_dp;
pub mod composition;
pub mod ledger;
pub mod registry;
pub mod traits;
