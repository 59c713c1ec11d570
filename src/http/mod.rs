pub mod mgmt;
pub mod reverseproxy;
