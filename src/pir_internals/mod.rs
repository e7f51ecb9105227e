pub mod branch_opt_util;
pub mod error;
pub mod hints;
pub mod params;
pub mod prf;
