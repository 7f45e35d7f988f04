//! Predicates evaluated by checks and triggers.

use std::any::type_name;
use std::fmt;

/// A predicate over sampled values.
///
/// Any `Fn(&T) -> bool` closure is a condition. The constructors in this module cover the
/// usual threshold comparisons and [`ConditionExt`] combines conditions.
///
/// # Example
///
/// ```
/// use tickwatch::{Condition, ConditionExt, above, below};
///
/// let healthy = above(10.0).and(below(90.0));
///
/// assert!(healthy.matches(&50.0));
/// assert!(!healthy.matches(&95.0));
/// assert!(healthy.not().matches(&5.0));
/// ```
pub trait Condition<T>: Send + Sync + 'static
where
    T: ?Sized,
{
    /// Whether `value` satisfies the condition.
    fn matches(&self, value: &T) -> bool;
}

impl<T, F> Condition<T> for F
where
    T: ?Sized,
    F: Fn(&T) -> bool + Send + Sync + 'static,
{
    #[cfg_attr(test, mutants::skip)] // Trivial forwarder.
    fn matches(&self, value: &T) -> bool {
        self(value)
    }
}

/// Matches values strictly greater than `threshold`.
#[must_use]
pub fn above<T>(threshold: T) -> impl Condition<T>
where
    T: PartialOrd + Send + Sync + 'static,
{
    move |value: &T| *value > threshold
}

/// Matches values greater than or equal to `threshold`.
#[must_use]
pub fn at_least<T>(threshold: T) -> impl Condition<T>
where
    T: PartialOrd + Send + Sync + 'static,
{
    move |value: &T| *value >= threshold
}

/// Matches values strictly less than `threshold`.
#[must_use]
pub fn below<T>(threshold: T) -> impl Condition<T>
where
    T: PartialOrd + Send + Sync + 'static,
{
    move |value: &T| *value < threshold
}

/// Matches values less than or equal to `threshold`.
#[must_use]
pub fn at_most<T>(threshold: T) -> impl Condition<T>
where
    T: PartialOrd + Send + Sync + 'static,
{
    move |value: &T| *value <= threshold
}

/// Matches values equal to `expected`.
#[must_use]
pub fn equal_to<T>(expected: T) -> impl Condition<T>
where
    T: PartialEq + Send + Sync + 'static,
{
    move |value: &T| *value == expected
}

/// Matches values in the inclusive range `low..=high`.
#[must_use]
pub fn between<T>(low: T, high: T) -> impl Condition<T>
where
    T: PartialOrd + Send + Sync + 'static,
{
    move |value: &T| low <= *value && *value <= high
}

/// Matches `true`. Used with boolean samplers such as [`Check::polling()`][crate::Check::polling].
#[must_use]
pub fn is_true() -> impl Condition<bool> {
    |value: &bool| *value
}

/// Combinators available on every [`Condition`].
pub trait ConditionExt<T>: Condition<T> + Sized
where
    T: ?Sized,
{
    /// Matches when both conditions match. `other` is not evaluated if `self` fails.
    fn and<C>(self, other: C) -> And<Self, C>
    where
        C: Condition<T>,
    {
        And {
            left: self,
            right: other,
        }
    }

    /// Matches when either condition matches. `other` is not evaluated if `self` matches.
    fn or<C>(self, other: C) -> Or<Self, C>
    where
        C: Condition<T>,
    {
        Or {
            left: self,
            right: other,
        }
    }

    /// Matches when this condition does not.
    fn not(self) -> Not<Self> {
        Not { inner: self }
    }
}

impl<T, C> ConditionExt<T> for C
where
    T: ?Sized,
    C: Condition<T>,
{
}

/// Conjunction of two conditions, created by [`ConditionExt::and()`].
pub struct And<A, B> {
    left: A,
    right: B,
}

impl<T, A, B> Condition<T> for And<A, B>
where
    T: ?Sized,
    A: Condition<T>,
    B: Condition<T>,
{
    fn matches(&self, value: &T) -> bool {
        self.left.matches(value) && self.right.matches(value)
    }
}

impl<A, B> fmt::Debug for And<A, B> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

/// Disjunction of two conditions, created by [`ConditionExt::or()`].
pub struct Or<A, B> {
    left: A,
    right: B,
}

impl<T, A, B> Condition<T> for Or<A, B>
where
    T: ?Sized,
    A: Condition<T>,
    B: Condition<T>,
{
    fn matches(&self, value: &T) -> bool {
        self.left.matches(value) || self.right.matches(value)
    }
}

impl<A, B> fmt::Debug for Or<A, B> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}

/// Negation of a condition, created by [`ConditionExt::not()`].
pub struct Not<C> {
    inner: C,
}

impl<T, C> Condition<T> for Not<C>
where
    T: ?Sized,
    C: Condition<T>,
{
    fn matches(&self, value: &T) -> bool {
        !self.inner.matches(value)
    }
}

impl<C> fmt::Debug for Not<C> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish_non_exhaustive()
    }
}
