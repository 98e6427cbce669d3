//! The system assertion database.
//!
//! Stores accepted assertions keyed by their type's primary-key headers.
//! Re-adding an assertion whose primary key is already present is
//! rejected with an unaccepted-update error; callers that only need the
//! assertion to be present treat that as success.

use thiserror::Error;

use super::{Assertion, AssertionType};

/// Errors from assertion database operations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// No assertion matched the query.
    #[error("{typ} assertion not found")]
    NotFound {
        /// The queried assertion type.
        typ: AssertionType,
    },

    /// An assertion with the same primary key is already stored.
    #[error("cannot accept {typ} assertion update for {primary_key}")]
    UnacceptedUpdate {
        /// The assertion type.
        typ: AssertionType,
        /// The primary key of the conflicting assertion.
        primary_key: String,
    },

    /// The assertion lacks one of its primary-key headers.
    #[error("{typ} assertion missing primary-key header {header}")]
    MissingPrimaryKey {
        /// The assertion type.
        typ: AssertionType,
        /// The missing header.
        header: &'static str,
    },
}

impl DatabaseError {
    /// Whether this error reports a cross update of an already stored
    /// assertion.
    #[must_use]
    pub const fn is_unaccepted_update(&self) -> bool {
        matches!(self, Self::UnacceptedUpdate { .. })
    }

    /// Whether this error reports an empty query result.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// In-memory assertion store.
#[derive(Debug, Default)]
pub struct Database {
    assertions: Vec<Assertion>,
}

impl Database {
    /// Create an empty database.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn primary_key_of(assertion: &Assertion) -> Result<Vec<&str>, DatabaseError> {
        let typ = assertion.assertion_type();
        typ.primary_key()
            .iter()
            .map(|header| {
                assertion
                    .header(header)
                    .ok_or(DatabaseError::MissingPrimaryKey { typ, header })
            })
            .collect()
    }

    /// Add an assertion.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::MissingPrimaryKey`] when the assertion
    /// lacks a primary-key header and [`DatabaseError::UnacceptedUpdate`]
    /// when an assertion with the same primary key is already stored.
    pub fn add(&mut self, assertion: Assertion) -> Result<(), DatabaseError> {
        let typ = assertion.assertion_type();
        let key = Self::primary_key_of(&assertion)?;
        for existing in self.assertions.iter().filter(|a| a.assertion_type() == typ) {
            let existing_key = Self::primary_key_of(existing)?;
            if existing_key == key {
                return Err(DatabaseError::UnacceptedUpdate {
                    typ,
                    primary_key: key.join("/"),
                });
            }
        }
        self.assertions.push(assertion);
        Ok(())
    }

    fn matches(assertion: &Assertion, headers: &[(&str, &str)]) -> bool {
        headers
            .iter()
            .all(|(name, value)| assertion.header(name) == Some(*value))
    }

    /// Find the assertion of `typ` matching all of `headers`.
    ///
    /// # Errors
    ///
    /// Returns [`DatabaseError::NotFound`] when nothing matches.
    pub fn find(
        &self,
        typ: AssertionType,
        headers: &[(&str, &str)],
    ) -> Result<&Assertion, DatabaseError> {
        self.assertions
            .iter()
            .find(|a| a.assertion_type() == typ && Self::matches(a, headers))
            .ok_or(DatabaseError::NotFound { typ })
    }

    /// Find every assertion of `typ` matching all of `headers`.
    #[must_use]
    pub fn find_many(&self, typ: AssertionType, headers: &[(&str, &str)]) -> Vec<&Assertion> {
        self.assertions
            .iter()
            .filter(|a| a.assertion_type() == typ && Self::matches(a, headers))
            .collect()
    }
}
