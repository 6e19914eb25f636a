//! Hazard core: IMT-level index, exceedance-curve algebra, hazard maps,
//! per-realization reshaping, source/realization progress tracking and the
//! calculator that drives them.

pub mod calculator;
pub mod curve;
pub mod error;
pub mod imt;
pub mod logictree;
pub mod maps;
pub mod progress;
pub mod reshape;
pub mod source;
