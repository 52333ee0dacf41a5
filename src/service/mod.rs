//! Request-side services: validation, query parsing, hydration, shaping.

pub mod hydrate;
pub mod query;
pub mod serializer;
pub mod validation;

pub use hydrate::expand_relations;
pub use query::{parse_filters, ListParams, PageMeta, QueryParams};
pub use serializer::{
    merge_shape, parse_shape_override, serialize_row, serialize_rows, validate_shape,
    FieldSelection, RelRender, RelShape, ResponseShape, ShapeOverride,
};
pub use validation::{validate_array, validate_object, ValidationMode};
