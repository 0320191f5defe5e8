//! Post-decode validation hooks.
//!
//! A [`Validator`] sees every value produced by `Context::data` as `&dyn Any`
//! and decides for itself which types it cares about. [`TypedValidator`]
//! covers the common case of a check bound to one destination type.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0}")]
    Invalid(String),

    #[error("{field}: {message}")]
    Field { field: String, message: String },
}

impl ValidationError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid(message.into())
    }

    pub fn field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub trait Validator: Send + Sync {
    fn validate(&self, target: &dyn Any) -> Result<(), ValidationError>;
}

/// Accepts everything. The engine default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl Validator for NoopValidator {
    fn validate(&self, _target: &dyn Any) -> Result<(), ValidationError> {
        Ok(())
    }
}

/// Runs `check` on values of type `T` and ignores every other type.
pub struct TypedValidator<T, F> {
    check: F,
    _target: PhantomData<fn(&T)>,
}

impl<T, F> TypedValidator<T, F>
where
    T: Any,
    F: Fn(&T) -> Result<(), ValidationError> + Send + Sync,
{
    pub fn new(check: F) -> Self {
        Self {
            check,
            _target: PhantomData,
        }
    }
}

impl<T, F> Validator for TypedValidator<T, F>
where
    T: Any,
    F: Fn(&T) -> Result<(), ValidationError> + Send + Sync,
{
    fn validate(&self, target: &dyn Any) -> Result<(), ValidationError> {
        match target.downcast_ref::<T>() {
            Some(value) => (self.check)(value),
            None => Ok(()),
        }
    }
}

/// Runs validators in order and stops at the first failure.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }
}

impl Validator for ValidatorChain {
    fn validate(&self, target: &dyn Any) -> Result<(), ValidationError> {
        self.validators
            .iter()
            .try_for_each(|validator| validator.validate(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Signup {
        name: String,
        age: u8,
    }

    fn name_required() -> TypedValidator<Signup, impl Fn(&Signup) -> Result<(), ValidationError>> {
        TypedValidator::new(|signup: &Signup| {
            if signup.name.is_empty() {
                return Err(ValidationError::field("name", "required"));
            }
            Ok(())
        })
    }

    #[test]
    fn typed_validator_ignores_other_types() {
        let validator = name_required();
        assert!(validator.validate(&42u32).is_ok());
        assert!(validator.validate(&"text").is_ok());
    }

    #[test]
    fn typed_validator_checks_its_type() {
        let validator = name_required();
        let bad = Signup {
            name: String::new(),
            age: 30,
        };

        let err = validator.validate(&bad).unwrap_err();
        assert_eq!(err.to_string(), "name: required");
    }

    #[test]
    fn chain_stops_at_first_error() {
        let chain = ValidatorChain::new()
            .with(name_required())
            .with(TypedValidator::new(|signup: &Signup| {
                if signup.age < 18 {
                    return Err(ValidationError::invalid("too young"));
                }
                Ok(())
            }));

        let young = Signup {
            name: "ada".into(),
            age: 12,
        };
        assert_eq!(
            chain.validate(&young),
            Err(ValidationError::invalid("too young"))
        );

        let ok = Signup {
            name: "ada".into(),
            age: 36,
        };
        assert!(chain.validate(&ok).is_ok());
        assert!(NoopValidator.validate(&young).is_ok());
    }
}
