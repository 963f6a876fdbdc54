pub mod config;
pub mod reducer;
pub mod sqlite_pragma;
