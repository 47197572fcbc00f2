//! Entity trait and per-type property descriptor tables
//!
//! Each entity type builds one [`Model`] describing its persisted properties
//! (name, scalar kind, accessors). The table is built once, stored in a
//! `OnceLock`, and shared by every executor for that type.
//!
//! ```ignore
//! impl Entity for Person {
//!     fn model() -> &'static Model<Self> {
//!         static MODEL: OnceLock<Model<Person>> = OnceLock::new();
//!         MODEL.get_or_init(|| {
//!             Model::<Self>::new("Person")
//!                 .field("name", |p| &p.name, |p| &mut p.name)
//!                 .field("age", |p| &p.age, |p| &mut p.age)
//!         })
//!     }
//!     fn id(&self) -> i64 { self.id }
//!     fn set_id(&mut self, id: i64) { self.id = id }
//! }
//! ```

use crate::dialect::Dialect;
use crate::value::{Field, ScalarKind, Value};
use crate::{Error, Result};

/// Name of the identity column on every table
pub const ID_COLUMN: &str = "id";

/// A record type with a 64-bit identity; zero means "not yet persisted"
pub trait Entity: Default + Clone + Send + Sync + 'static {
    fn model() -> &'static Model<Self>;

    fn id(&self) -> i64;

    fn set_id(&mut self, id: i64);
}

type Getter<E> = Box<dyn Fn(&E) -> Value + Send + Sync>;
type Setter<E> = Box<dyn Fn(&mut E, &Value) -> Result<()> + Send + Sync>;

/// Descriptor for one persisted property
pub struct Property<E> {
    name: &'static str,
    kind: ScalarKind,
    zero: Value,
    get: Getter<E>,
    set: Setter<E>,
}

impl<E> Property<E> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> ScalarKind {
        self.kind
    }

    /// Value written by a partial delete
    pub fn zero(&self) -> &Value {
        &self.zero
    }

    pub fn read(&self, entity: &E) -> Value {
        (self.get)(entity)
    }

    pub fn write(&self, entity: &mut E, value: &Value) -> Result<()> {
        (self.set)(entity, value)
    }

    pub fn reset(&self, entity: &mut E) -> Result<()> {
        (self.set)(entity, &self.zero)
    }
}

impl<E> std::fmt::Debug for Property<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Property descriptor table for one entity type
#[derive(Debug)]
pub struct Model<E> {
    name: &'static str,
    properties: Vec<Property<E>>,
}

impl<E: 'static> Model<E> {
    pub fn new(name: &'static str) -> Self {
        Self { name, properties: Vec::new() }
    }

    /// Declare a property backed by a field of type `T`
    pub fn field<T: Field>(
        mut self,
        name: &'static str,
        get: fn(&E) -> &T,
        get_mut: fn(&mut E) -> &mut T,
    ) -> Self {
        self.properties.push(Property {
            name,
            kind: T::KIND,
            zero: T::zero().to_value(),
            get: Box::new(move |entity| get(entity).to_value()),
            set: Box::new(move |entity, value| {
                *get_mut(entity) = T::from_value(value)?;
                Ok(())
            }),
        });
        self
    }

    /// Type name; also the default table or collection name
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn properties(&self) -> &[Property<E>] {
        &self.properties
    }

    pub fn property(&self, name: &str) -> Option<&Property<E>> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a property or fail with `UnknownProperty`
    pub fn require(&self, name: &str) -> Result<&Property<E>> {
        self.property(name).ok_or_else(|| Error::UnknownProperty {
            model: self.name.to_string(),
            property: name.to_string(),
        })
    }

    /// Check every declared property against a dialect's type table
    pub fn validate(&self, dialect: Dialect) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for property in &self.properties {
            if property.name.eq_ignore_ascii_case(ID_COLUMN) {
                return Err(Error::MalformedConfiguration(format!(
                    "{} declares `{}` as a property; identity is managed by the entity",
                    self.name, property.name
                )));
            }
            if !seen.insert(dialect.normalize_column_name(property.name)) {
                return Err(Error::MalformedConfiguration(format!(
                    "{} declares `{}` twice under {}",
                    self.name, property.name, dialect
                )));
            }
            if dialect.native_type(property.kind).is_none() {
                return Err(Error::unsupported(
                    dialect,
                    format!("{} property `{}.{}`", property.kind, self.name, property.name),
                ));
            }
        }
        Ok(())
    }

    /// Read every property, in declaration order
    pub fn read_all(&self, entity: &E) -> Vec<Value> {
        self.properties.iter().map(|p| p.read(entity)).collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    #[derive(Debug, Clone, Default, PartialEq)]
    pub(crate) struct Person {
        pub id: i64,
        pub name: String,
        pub age: i32,
        pub tags: Vec<String>,
    }

    impl Entity for Person {
        fn model() -> &'static Model<Self> {
            static MODEL: OnceLock<Model<Person>> = OnceLock::new();
            MODEL.get_or_init(|| {
                Model::<Person>::new("Person")
                    .field("name", |p| &p.name, |p| &mut p.name)
                    .field("age", |p| &p.age, |p| &mut p.age)
                    .field("tags", |p| &p.tags, |p| &mut p.tags)
            })
        }

        fn id(&self) -> i64 {
            self.id
        }

        fn set_id(&mut self, id: i64) {
            self.id = id;
        }
    }

    impl Person {
        pub(crate) fn new(name: &str, age: i32) -> Self {
            Self { name: name.to_string(), age, ..Default::default() }
        }
    }

    #[test]
    fn test_model_reads_and_writes_properties() {
        let model = Person::model();
        let mut person = Person::new("ada", 36);

        let age = model.require("age").unwrap();
        assert_eq!(age.kind(), ScalarKind::Int);
        assert_eq!(age.read(&person), Value::Int(36));

        age.write(&mut person, &Value::Int(37)).unwrap();
        assert_eq!(person.age, 37);

        age.reset(&mut person).unwrap();
        assert_eq!(person.age, 0);
        assert_eq!(person.name, "ada");
    }

    #[test]
    fn test_unknown_property() {
        let err = Person::model().require("height").unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));
    }

    #[test]
    fn test_validate_against_type_tables() {
        let model = Person::model();
        assert!(model.validate(Dialect::Sqlite).is_ok());
        assert!(model.validate(Dialect::DuckDb).is_ok());

        // H2 has no list type
        let err = model.validate(Dialect::H2).unwrap_err();
        assert!(matches!(
            err,
            Error::CapabilityUnsupported { dialect: Dialect::H2, .. }
        ));
    }

    #[test]
    fn test_validate_rejects_id_property() {
        #[derive(Debug, Clone, Default)]
        struct Bad {
            id: i64,
        }
        let model = Model::<Bad>::new("Bad").field("id", |b| &b.id, |b| &mut b.id);
        assert!(matches!(
            model.validate(Dialect::Sqlite),
            Err(Error::MalformedConfiguration(_))
        ));
    }
}
