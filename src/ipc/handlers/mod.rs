pub mod classes;
pub mod core;
pub mod disciplines;
pub mod grades;
pub mod reports;
pub mod setup;
pub mod students;
