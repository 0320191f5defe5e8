use serde::de::DeserializeOwned;
use serde::de::value::Error as DeError;
use std::str::FromStr;
use url::form_urlencoded;

/// Ordered multimap of decoded query or form pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Values {
    pairs: Vec<(String, String)>,
}

impl Values {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decodes an `application/x-www-form-urlencoded` string.
    pub fn parse(input: &str) -> Self {
        Self::parse_bytes(input.as_bytes())
    }

    pub fn parse_bytes(input: &[u8]) -> Self {
        form_urlencoded::parse(input).into_owned().collect()
    }

    /// First value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.pairs
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((key.into(), value.into()));
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.pairs.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn encode(&self) -> String {
        form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.iter())
            .finish()
    }

    /// Binds the pairs onto a flat struct; numbers and booleans are parsed
    /// from their string form. Repeated keys fill sequence fields, while a
    /// scalar field takes the first value.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, DeError> {
        de::from_pairs(&self.pairs)
    }
}

impl FromIterator<(String, String)> for Values {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

impl Extend<(String, String)> for Values {
    fn extend<I: IntoIterator<Item = (String, String)>>(&mut self, iter: I) {
        self.pairs.extend(iter);
    }
}

/// A single query or form value; empty when the key was absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Value(Option<String>);

impl Value {
    pub fn new(raw: Option<&str>) -> Self {
        Self(raw.map(str::to_owned))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_deref().unwrap_or_default()
    }

    pub fn is_present(&self) -> bool {
        self.0.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.as_str().is_empty()
    }

    pub fn parse<T: FromStr>(&self) -> Result<T, T::Err> {
        self.as_str().parse()
    }

    /// The value, or `default` when absent or empty.
    pub fn or<'a>(&'a self, default: &'a str) -> &'a str {
        match self.as_str() {
            "" => default,
            value => value,
        }
    }

    pub fn into_inner(self) -> Option<String> {
        self.0
    }
}

mod de {
    use serde::de::value::{Error, MapDeserializer, SeqDeserializer, StrDeserializer};
    use serde::de::{self, DeserializeOwned, Deserializer, IntoDeserializer, Visitor};
    use serde::forward_to_deserialize_any;

    pub(super) fn from_pairs<T: DeserializeOwned>(pairs: &[(String, String)]) -> Result<T, Error> {
        let mut fields: Vec<(&str, Field<'_>)> = Vec::new();
        for (key, value) in pairs {
            match fields.iter_mut().find(|(name, _)| *name == key) {
                Some((_, field)) => field.0.push(value.as_str()),
                None => fields.push((key.as_str(), Field(vec![value.as_str()]))),
            }
        }
        T::deserialize(MapDeserializer::<_, Error>::new(fields.into_iter()))
    }

    /// Every value sent for one key, in request order.
    struct Field<'a>(Vec<&'a str>);

    impl<'a> Field<'a> {
        fn first(&self) -> Part<'a> {
            Part(self.0.first().copied().unwrap_or_default())
        }
    }

    impl<'de, 'a> IntoDeserializer<'de, Error> for Field<'a> {
        type Deserializer = Self;

        fn into_deserializer(self) -> Self {
            self
        }
    }

    macro_rules! first_value {
        ($($method:ident)*) => {
            $(
                fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
                    self.first().$method(visitor)
                }
            )*
        };
    }

    impl<'de, 'a> Deserializer<'de> for Field<'a> {
        type Error = Error;

        fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            if self.0.len() == 1 {
                self.first().deserialize_any(visitor)
            } else {
                self.deserialize_seq(visitor)
            }
        }

        fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            let parts = self.0.into_iter().map(Part);
            visitor.visit_seq(SeqDeserializer::<_, Error>::new(parts))
        }

        fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            visitor.visit_some(self)
        }

        fn deserialize_newtype_struct<V: Visitor<'de>>(
            self,
            _name: &'static str,
            visitor: V,
        ) -> Result<V::Value, Error> {
            visitor.visit_newtype_struct(self)
        }

        fn deserialize_enum<V: Visitor<'de>>(
            self,
            name: &'static str,
            variants: &'static [&'static str],
            visitor: V,
        ) -> Result<V::Value, Error> {
            self.first().deserialize_enum(name, variants, visitor)
        }

        first_value! {
            deserialize_bool deserialize_char deserialize_str deserialize_string
            deserialize_i8 deserialize_i16 deserialize_i32 deserialize_i64
            deserialize_u8 deserialize_u16 deserialize_u32 deserialize_u64
            deserialize_f32 deserialize_f64 deserialize_unit deserialize_identifier
        }

        forward_to_deserialize_any! {
            i128 u128 bytes byte_buf unit_struct tuple tuple_struct map struct ignored_any
        }
    }

    /// One raw value, parsed into whatever scalar the target asks for.
    struct Part<'a>(&'a str);

    impl<'de, 'a> IntoDeserializer<'de, Error> for Part<'a> {
        type Deserializer = Self;

        fn into_deserializer(self) -> Self {
            self
        }
    }

    macro_rules! parse_value {
        ($($method:ident => $visit:ident,)*) => {
            $(
                fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
                    match self.0.parse() {
                        Ok(value) => visitor.$visit(value),
                        Err(_) => Err(<Error as de::Error>::invalid_value(
                            de::Unexpected::Str(self.0),
                            &visitor,
                        )),
                    }
                }
            )*
        };
    }

    impl<'de, 'a> Deserializer<'de> for Part<'a> {
        type Error = Error;

        fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            visitor.visit_str(self.0)
        }

        fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            visitor.visit_some(self)
        }

        fn deserialize_unit<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            visitor.visit_unit()
        }

        fn deserialize_seq<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, Error> {
            visitor.visit_seq(SeqDeserializer::<_, Error>::new(std::iter::once(self)))
        }

        fn deserialize_newtype_struct<V: Visitor<'de>>(
            self,
            _name: &'static str,
            visitor: V,
        ) -> Result<V::Value, Error> {
            visitor.visit_newtype_struct(self)
        }

        fn deserialize_enum<V: Visitor<'de>>(
            self,
            _name: &'static str,
            _variants: &'static [&'static str],
            visitor: V,
        ) -> Result<V::Value, Error> {
            let variant: StrDeserializer<'a, Error> = self.0.into_deserializer();
            visitor.visit_enum(variant)
        }

        parse_value! {
            deserialize_bool => visit_bool,
            deserialize_char => visit_char,
            deserialize_i8 => visit_i8,
            deserialize_i16 => visit_i16,
            deserialize_i32 => visit_i32,
            deserialize_i64 => visit_i64,
            deserialize_u8 => visit_u8,
            deserialize_u16 => visit_u16,
            deserialize_u32 => visit_u32,
            deserialize_u64 => visit_u64,
            deserialize_f32 => visit_f32,
            deserialize_f64 => visit_f64,
        }

        forward_to_deserialize_any! {
            i128 u128 str string bytes byte_buf unit_struct tuple tuple_struct map struct
            identifier ignored_any
        }
    }
}
