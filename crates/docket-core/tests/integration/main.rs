mod checkpoint_tests;
mod common;
mod resume_tests;
