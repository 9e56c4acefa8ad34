pub mod object;
pub mod predictor;
pub mod sim;
pub mod spatial;
