mod helpers;

mod consolidation_tests;
mod store_tests;
