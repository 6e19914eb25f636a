pub mod calc;
pub mod discard;
pub mod job;
pub mod maps;
pub mod resume;
pub mod status;
