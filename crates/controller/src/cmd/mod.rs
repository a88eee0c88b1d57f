pub mod daemon;
pub mod send;
pub mod show_table;
