//! Output formats for correlated IOC collections.

pub mod formats;
pub mod stix;
