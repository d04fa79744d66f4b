//! Error plumbing shared by the detalloc crates.
//!
//! - [`Location`] is captured implicitly by snafu error variants so that a
//!   report can point at the call site that produced the error.
//! - [`Report`] renders an error, its location and its `source()` chain on
//!   multiple lines.
//! - [`GenericError`] is a `whatever`-style error for tools that only need to
//!   attach context to a failure.

#![no_std]

extern crate alloc;

use alloc::{boxed::Box, string::String};
use core::{error::Error, fmt};

use snafu::{GenerateImplicitData, Snafu};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static core::panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(core::panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Location {
    #[must_use]
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

/// Errors that remember where they were raised.
pub trait Located {
    fn location(&self) -> Location;
}

impl<E> Located for &E
where
    E: Located + ?Sized,
{
    fn location(&self) -> Location {
        (**self).location()
    }
}

#[derive(Debug, Snafu)]
#[snafu(whatever, display("{message}"))]
pub struct GenericError {
    message: String,
    #[snafu(implicit)]
    location: Location,
    #[snafu(source(from(Box<dyn core::error::Error>, Some)))]
    source: Option<Box<dyn core::error::Error>>,
}

impl Located for GenericError {
    fn location(&self) -> Location {
        self.location
    }
}

pub struct Report<E> {
    error: E,
    location: Option<Location>,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Error: {}", self.error)?;
        if let Some(loc) = &self.location {
            writeln!(f, "  at {loc}")?;
        }
        let mut source = self.error.source();
        if source.is_some() {
            writeln!(f)?;
            writeln!(f, "Caused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            writeln!(f, "{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self {
            error,
            location: None,
        }
    }

    pub fn located(error: E) -> Self
    where
        E: Located,
    {
        let location = Some(error.location());
        Self { error, location }
    }

    pub fn error(&self) -> &E {
        &self.error
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use alloc::string::ToString as _;

    use snafu::{ResultExt as _, whatever};

    use super::*;

    #[derive(Debug, Snafu)]
    #[snafu(display("inner failure"))]
    struct Inner;

    fn failing() -> Result<(), GenericError> {
        Err(Inner).whatever_context("outer failure")
    }

    #[test]
    fn test_report_lists_source_chain() {
        let err = failing().unwrap_err();
        let text = Report::located(err).to_string();
        assert!(text.starts_with("Error: outer failure\n  at "));
        assert!(text.contains("Caused by:"));
        assert!(text.contains("   0: inner failure"));
    }

    #[test]
    fn test_report_without_location() {
        let text = Report::new(Inner).to_string();
        assert_eq!(text, "Error: inner failure\n");
    }

    #[test]
    fn test_location_points_at_caller() {
        fn raise() -> Result<(), GenericError> {
            whatever!("boom")
        }
        let err = raise().unwrap_err();
        assert!(err.location().file().ends_with("lib.rs"));
        assert!(err.location().line() > 0);
    }
}
