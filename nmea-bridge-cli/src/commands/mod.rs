pub mod run;
pub mod sources;
