//! Route 53 resource providers for the Stratus deployment engine.

mod recordset;

pub use recordset::Route53RecordSetProvider;
