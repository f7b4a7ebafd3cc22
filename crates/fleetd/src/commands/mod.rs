pub mod cloud_check;
pub mod delete;
pub mod deploy;
pub mod instances;
