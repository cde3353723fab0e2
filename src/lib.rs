pub mod ancestral;
pub mod error;
pub mod expr;
pub mod io;
pub mod likelihood;
pub mod logger;
pub mod model;
pub mod probs;
pub mod progress;
pub mod trajectory;
pub mod tree;
pub mod vector;

pub use error::ScoalError;
pub use likelihood::StructuredTreeLikelihood;
pub use model::PopModel;
pub use tree::Tree;
