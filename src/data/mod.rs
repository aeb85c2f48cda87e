//! Data structures for batch-effect correction.

mod batch;
mod design_matrix;
mod expression_matrix;
mod formula;
mod metadata;

pub use batch::{BatchLabels, SingletonPolicy};
pub use design_matrix::DesignMatrix;
pub use expression_matrix::ExpressionMatrix;
pub(crate) use expression_matrix::ensure_finite;
pub use formula::Formula;
pub use metadata::{Metadata, Variable, VariableType};
