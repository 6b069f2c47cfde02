pub mod archive;
pub mod users;
