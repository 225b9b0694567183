pub mod actor;
pub mod booking;
pub mod payment;
pub mod rating;
pub mod vehicle;
