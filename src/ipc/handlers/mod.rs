pub mod auth;
pub mod core;
pub mod courses;
pub mod enrollments;
pub mod feedback;
pub mod forms;
pub mod reports;
pub mod subjects;
pub mod users;
