// courier-common: wire types shared by the relay and its clients

pub mod protocol;
pub mod types;
