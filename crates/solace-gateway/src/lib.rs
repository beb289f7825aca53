pub mod connection;
pub mod dispatcher;
pub mod ordering;
pub mod presence;
pub mod registry;
pub mod unread;
