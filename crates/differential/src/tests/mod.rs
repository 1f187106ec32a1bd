mod component_tests;
mod record_tests;
