//! Composable validation rules.
//!
//! A [`Rule`] is a pure function of the license, the holder's parameters and
//! the current time. Rules are collected into ordered [`RuleGroup`]s, which
//! are rules themselves, so cross-cutting checks can be added without
//! touching the per-type logic.

use chrono::{DateTime, TimeDelta, Utc};

use super::{Failure, Params, Verdict};
use crate::model::License;

pub trait Rule: Send + Sync {
  fn name(&self) -> &str;

  fn check(&self, license: &License, params: &Params, now: DateTime<Utc>)
  -> Verdict;
}

/// Ordered rules, evaluated until the first failure.
pub struct RuleGroup {
  name: String,
  rules: Vec<Box<dyn Rule>>,
}

impl RuleGroup {
  pub fn new(name: impl Into<String>) -> Self {
    Self { name: name.into(), rules: Vec::new() }
  }

  pub fn rule(mut self, rule: impl Rule + 'static) -> Self {
    self.rules.push(Box::new(rule));
    self
  }

  pub fn rules(&self) -> impl Iterator<Item = &dyn Rule> {
    self.rules.iter().map(|rule| rule.as_ref())
  }
}

impl std::fmt::Debug for RuleGroup {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RuleGroup")
      .field("name", &self.name)
      .field("rules", &self.rules().map(|rule| rule.name()).collect::<Vec<_>>())
      .finish()
  }
}

impl Rule for RuleGroup {
  fn name(&self) -> &str {
    &self.name
  }

  fn check(
    &self,
    license: &License,
    params: &Params,
    now: DateTime<Utc>,
  ) -> Verdict {
    self.rules.iter().try_for_each(|rule| rule.check(license, params, now))
  }
}

/// Wraps a closure as a named rule.
pub struct FnRule<F> {
  name: String,
  f: F,
}

pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnRule<F>
where
  F: Fn(&License, &Params, DateTime<Utc>) -> Verdict + Send + Sync,
{
  FnRule { name: name.into(), f }
}

impl<F> Rule for FnRule<F>
where
  F: Fn(&License, &Params, DateTime<Utc>) -> Verdict + Send + Sync,
{
  fn name(&self) -> &str {
    &self.name
  }

  fn check(
    &self,
    license: &License,
    params: &Params,
    now: DateTime<Utc>,
  ) -> Verdict {
    (self.f)(license, params, now)
  }
}

/// Rejects licenses issued after "now" (plus some skew), which indicates a
/// rolled-back clock.
#[derive(Debug, Clone, Copy)]
pub struct IssuedNotInFuture {
  pub tolerance: TimeDelta,
}

impl Default for IssuedNotInFuture {
  fn default() -> Self {
    Self { tolerance: TimeDelta::minutes(5) }
  }
}

impl Rule for IssuedNotInFuture {
  fn name(&self) -> &str {
    "issued-not-in-future"
  }

  fn check(
    &self,
    license: &License,
    _params: &Params,
    now: DateTime<Utc>,
  ) -> Verdict {
    if license.issued_on() > now + self.tolerance {
      return Err(Failure::Rule {
        rule: self.name().to_string(),
        reason: "system clock is set before license issuance".into(),
      });
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExpiryAfterIssue;

impl Rule for ExpiryAfterIssue {
  fn name(&self) -> &str {
    "expiry-after-issue"
  }

  fn check(
    &self,
    license: &License,
    _params: &Params,
    _now: DateTime<Utc>,
  ) -> Verdict {
    match license.expiration_date() {
      Some(expiration) if expiration < license.issued_on() => {
        Err(Failure::Malformed("expiration precedes issue date".into()))
      }
      _ => Ok(()),
    }
  }
}

/// Requires a feature to be present and enabled.
#[derive(Debug, Clone)]
pub struct RequireFeature(pub String);

impl Rule for RequireFeature {
  fn name(&self) -> &str {
    "require-feature"
  }

  fn check(
    &self,
    license: &License,
    _params: &Params,
    _now: DateTime<Utc>,
  ) -> Verdict {
    if license.is_feature_enabled(&self.0) {
      Ok(())
    } else {
      Err(Failure::Rule {
        rule: self.name().to_string(),
        reason: format!("feature '{}' is not licensed", self.0),
      })
    }
  }
}
