pub mod celu;
pub mod preact_block;
