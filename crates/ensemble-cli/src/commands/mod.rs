pub mod run;
pub mod scan;
pub mod worker;
