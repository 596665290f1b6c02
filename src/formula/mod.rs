pub mod pattern;
pub mod structure;

pub use pattern::{RelativeMode, parse_base_formula, shift_formula_ast};
pub use structure::{Axis, StructuralChange, StructureEdit};
