//! Value object trait: equality by value, not identity.

/// Marker trait for value objects.
///
/// Value objects are immutable and compared by their attribute values
/// (`Quantity(10) == Quantity(10)`), unlike entities which carry identity.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
