pub mod admin;
pub mod audit;
pub mod quota;
pub mod scope;
pub mod ticket;
pub mod token;
