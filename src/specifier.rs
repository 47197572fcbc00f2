//! Typed references to entity properties

use crate::constraint::Constraint;
use crate::dialect::Dialect;
use crate::model::{Entity, Property};
use crate::value::Field;
use crate::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::marker::PhantomData;

/// Handle to exactly one property of one entity type.
///
/// The column a specifier resolves to depends only on the property name and
/// the dialect, so two specifiers naming the same property always agree.
/// Serializes as the bare property name.
pub struct Specifier<E, T> {
    name: Cow<'static, str>,
    _marker: PhantomData<fn() -> (E, T)>,
}

impl<E, T> Specifier<E, T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name: Cow::Borrowed(name), _marker: PhantomData }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Quoted, normalized column name under `dialect`
    pub fn column(&self, dialect: Dialect) -> String {
        dialect.column(&self.name)
    }
}

impl<E: Entity, T: Field> Specifier<E, T> {
    /// Start a constraint on this property
    pub fn constraint(&self) -> Constraint<E, T> {
        Constraint::new(self.clone())
    }

    pub fn resolve(&self) -> Result<&'static Property<E>> {
        E::model().require(&self.name)
    }
}

impl<E, T> Clone for Specifier<E, T> {
    fn clone(&self) -> Self {
        Self { name: self.name.clone(), _marker: PhantomData }
    }
}

impl<E, T> PartialEq for Specifier<E, T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<E, T> Eq for Specifier<E, T> {}

impl<E, T> std::fmt::Debug for Specifier<E, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Specifier").field(&self.name).finish()
    }
}

impl<E, T> Serialize for Specifier<E, T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name)
    }
}

impl<'de, E, T> Deserialize<'de> for Specifier<E, T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self { name: Cow::Owned(name), _marker: PhantomData })
    }
}

/// Untyped view of a specifier, for operations over several properties at once
pub trait PropertyRef<E> {
    fn property_name(&self) -> &str;
}

impl<E, T> PropertyRef<E> for Specifier<E, T> {
    fn property_name(&self) -> &str {
        &self.name
    }
}

impl<E> PropertyRef<E> for &str {
    fn property_name(&self) -> &str {
        self
    }
}
