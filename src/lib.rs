pub mod batch;
pub mod inkscape;
pub mod output;
