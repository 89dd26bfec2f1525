#![warn(missing_docs)]
#![doc(test(no_crate_inject))]
#![doc(test(attr(deny(unused, future_incompatible))))]

//! This crate learns the structure of a Bayesian network from categorical data using the K2
//! algorithm, as described in:
//!
//! - Cooper and Herskovits, [A Bayesian Method for the Induction of Probabilistic Networks from
//!   Data][k2], 1992
//!
//! [k2]: https://link.springer.com/article/10.1007/BF00994110
//!
//! K2 needs a topological ordering of the variables up front, and only lets a variable choose
//! parents from the variables that come before it. That keeps every learned graph acyclic without
//! any explicit cycle check, but the result depends heavily on the ordering. So [`learn`] tries a
//! number of random orderings and keeps whichever network scores best, which is a cheap
//! approximation of searching over orderings too.
//!
//! The learned network can then be used to classify new rows with a [`Predictor`]. The class label
//! is itself a node in the network (the last variable), so the search is free to discover which
//! attributes the class depends on and which attributes depend on the class.

pub use rand;

use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use smallvec::{smallvec, SmallVec};
use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;
use std::iter;
use tracing::{debug, info, trace};

/// Everything that can go wrong while building datasets, learning networks, or predicting.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Two inputs that must pair up element by element had different lengths.
    #[error("expected {expected} values but found {found}")]
    MismatchedLengths {
        /// The length required by the other input.
        expected: usize,
        /// The length actually supplied.
        found: usize,
    },

    /// A row did not have one value per attribute.
    #[error("row {row} has {found} values but there are {expected} attributes")]
    RowWidth {
        /// Position of the offending row.
        row: usize,
        /// The number of attributes in the dataset.
        expected: usize,
        /// The number of values in the row.
        found: usize,
    },

    /// A row referred to a class that has no name.
    #[error("row {row} has class {class} but only {classes} classes are known")]
    UnknownClass {
        /// Position of the offending row.
        row: usize,
        /// The class index found in the row.
        class: usize,
        /// The number of known classes.
        classes: usize,
    },

    /// The header did not even name a class column.
    #[error("the header must name at least the class column")]
    MissingClassColumn,

    /// A variable index was not less than the number of variables.
    #[error("variable {variable} does not exist; there are {variables} variables")]
    VariableOutOfRange {
        /// The requested variable.
        variable: usize,
        /// The number of variables in the dataset.
        variables: usize,
    },

    /// A row index was not less than the number of rows.
    #[error("row {row} does not exist; there are {rows} rows")]
    RowOutOfRange {
        /// The requested row.
        row: usize,
        /// The number of rows in the dataset.
        rows: usize,
    },

    /// A network did not have exactly one parent set per variable in the dataset.
    #[error("network has {found} variables but the dataset has {expected}")]
    NetworkSize {
        /// The number of variables in the dataset.
        expected: usize,
        /// The number of parent sets in the network.
        found: usize,
    },

    /// A parent set named its own variable.
    #[error("variable {0} cannot be its own parent")]
    SelfParent(usize),

    /// The smoothing constant was negative, infinite, or NaN.
    #[error("smoothing constant must be finite and non-negative, not {0}")]
    InvalidSmoothing(f64),

    /// Random search was configured with zero trials.
    #[error("at least one search trial is required")]
    NoTrials,

    /// An ordering was not a permutation of every variable.
    #[error("ordering is not a permutation of the {variables} variables")]
    InvalidOrdering {
        /// The number of variables in the dataset.
        variables: usize,
    },

    /// Probabilities were requested from a dataset with no rows.
    #[error("cannot estimate probabilities from an empty training set")]
    EmptyTrainingSet,
}

/// Shorthand for results whose error type is this crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// One observed value of one attribute.
///
/// Values of different kinds are never equal to each other. Numbers are equal if they differ by
/// less than [`Value::EPSILON`], so equality is not transitive for numbers; everything here only
/// ever compares values pairwise.
///
/// ```
/// use k2net::Value;
///
/// assert_eq!(Value::Number(0.5), Value::Number(0.5 + 1e-9));
/// assert_ne!(Value::Number(1.0), Value::from("1"));
/// assert_eq!(Value::Wildcard, Value::Wildcard);
/// assert_ne!(Value::Wildcard, Value::from("?"));
/// ```
#[derive(Clone, Debug)]
pub enum Value {
    /// A missing or unknown value. It only matches another wildcard.
    Wildcard,
    /// A numeric value.
    Number(f64),
    /// A textual value, compared exactly.
    Text(String),
}

impl Value {
    /// Numbers closer together than this are considered equal.
    pub const EPSILON: f64 = 1e-6;

    /// Interprets a field from a delimited text file.
    ///
    /// Empty fields and `?` are wildcards, anything that parses as a number is a number, and
    /// everything else is text.
    ///
    /// ```
    /// use k2net::Value;
    ///
    /// assert!(Value::parse(" ? ").is_wildcard());
    /// assert_eq!(Value::parse("2.50"), Value::Number(2.5));
    /// assert_eq!(Value::parse("red"), Value::from("red"));
    /// ```
    pub fn parse(field: &str) -> Value {
        let field = field.trim();
        if field.is_empty() || field == "?" {
            Value::Wildcard
        } else {
            match field.parse::<f64>() {
                Ok(number) if number.is_finite() => Value::Number(number),
                _ => Value::Text(field.to_owned()),
            }
        }
    }

    /// Returns `true` if this is [`Value::Wildcard`].
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Value::Wildcard)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Wildcard, Value::Wildcard) => true,
            (Value::Number(a), Value::Number(b)) => (a - b).abs() < Value::EPSILON,
            (Value::Text(a), Value::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Wildcard => f.write_str("?"),
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// The distinct values observed for one variable, in the order they were first seen.
///
/// The position of a value in its domain is called its "level", and is what the scoring code
/// actually counts with.
///
/// ```
/// use k2net::{Domain, Value};
///
/// let domain: Domain = vec![Value::from("b"), Value::from("a"), Value::from("b")]
///     .into_iter()
///     .collect();
/// assert_eq!(domain.len(), 2);
/// assert_eq!(domain.level(&Value::from("a")), Some(1));
/// assert_eq!(domain.level(&Value::Wildcard), None);
/// ```
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Domain(Vec<Value>);

impl Domain {
    /// Creates an empty domain.
    pub fn new() -> Self {
        Domain(Vec::new())
    }

    /// Adds a value if it isn't already present, and returns its level either way.
    pub fn insert(&mut self, value: &Value) -> usize {
        match self.level(value) {
            Some(level) => level,
            None => {
                self.0.push(value.clone());
                self.0.len() - 1
            }
        }
    }

    /// Returns the level of an equal value, if there is one.
    pub fn level(&self, value: &Value) -> Option<usize> {
        self.0.iter().position(|v| v == value)
    }

    /// The number of distinct values.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if no values have been observed.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The distinct values, indexed by level.
    pub fn values(&self) -> &[Value] {
        &self.0
    }
}

impl iter::FromIterator<Value> for Domain {
    fn from_iter<I: IntoIterator<Item = Value>>(iter: I) -> Self {
        let mut domain = Domain::new();
        for value in iter {
            domain.insert(&value);
        }
        domain
    }
}

/// Level indices for one parent instantiation. Parent sets are small, so these rarely allocate.
pub type Levels = SmallVec<[usize; 4]>;

/// Enumerates every combination of positions for a list of domain sizes, in lexicographic order.
///
/// This is the index-level engine behind [`cartesian_product`]. The product of zero domains is a
/// single empty combination, which is exactly what scoring a variable with no parents needs. If
/// any domain is empty, there are no combinations at all.
///
/// ```
/// use k2net::Instantiations;
///
/// let all: Vec<Vec<usize>> = Instantiations::new(&[2, 3]).map(|l| l.to_vec()).collect();
/// assert_eq!(all.len(), 6);
/// assert_eq!(all[0], [0, 0]);
/// assert_eq!(all[1], [0, 1]);
/// assert_eq!(all[5], [1, 2]);
///
/// assert_eq!(Instantiations::new(&[]).count(), 1);
/// assert_eq!(Instantiations::new(&[4, 0]).count(), 0);
/// ```
#[derive(Clone, Debug)]
pub struct Instantiations {
    sizes: Levels,
    next: Option<Levels>,
}

impl Instantiations {
    /// Starts enumerating combinations for domains of the given sizes.
    pub fn new(sizes: &[usize]) -> Self {
        let next = if sizes.iter().all(|&size| size > 0) {
            Some(smallvec![0; sizes.len()])
        } else {
            None
        };
        Instantiations {
            sizes: SmallVec::from_slice(sizes),
            next,
        }
    }
}

impl Iterator for Instantiations {
    type Item = Levels;

    fn next(&mut self) -> Option<Levels> {
        let current = self.next.take()?;
        let mut following = current.clone();
        // Odometer: bump the last position, carrying leftward. Running off the left end means
        // every combination has been produced.
        for position in (0..following.len()).rev() {
            following[position] += 1;
            if following[position] < self.sizes[position] {
                self.next = Some(following);
                break;
            }
            following[position] = 0;
        }
        Some(current)
    }
}

impl iter::FusedIterator for Instantiations {}

/// Returns every tuple formed by picking one element from each domain, preserving domain order
/// within each tuple.
///
/// Domains are assumed to be free of duplicates already, so no tuple is produced twice. The cost
/// is the product of the domain sizes; keeping that bounded is the caller's job.
///
/// ```
/// use k2net::cartesian_product;
///
/// let a = [1, 2];
/// let b = [3, 4, 5];
/// let tuples: Vec<Vec<&i32>> = cartesian_product(&[&a[..], &b[..]]).collect();
/// assert_eq!(tuples.len(), 6);
/// assert_eq!(tuples[0], [&1, &3]);
/// assert_eq!(tuples[5], [&2, &5]);
///
/// let none: [&[i32]; 0] = [];
/// assert_eq!(cartesian_product(&none).collect::<Vec<_>>(), [Vec::<&i32>::new()]);
/// ```
pub fn cartesian_product<'a, T: 'a>(
    domains: &[&'a [T]],
) -> impl Iterator<Item = Vec<&'a T>> + 'a {
    let sizes: Levels = domains.iter().map(|domain| domain.len()).collect();
    let domains = domains.to_vec();
    Instantiations::new(&sizes).map(move |levels| {
        levels
            .iter()
            .zip(domains.iter())
            .map(|(&level, &domain)| &domain[level])
            .collect()
    })
}

/// One observation: a value for every attribute, plus the index of its class.
#[derive(Clone, Debug, PartialEq)]
pub struct Row {
    /// One value per attribute, in column order.
    pub values: Vec<Value>,
    /// Index into the dataset's class names.
    pub class: usize,
}

impl Row {
    /// Creates a row.
    pub fn new(values: Vec<Value>, class: usize) -> Self {
        Row { values, class }
    }
}

/// A table of observations, along with the per-variable domains that structure learning needs.
///
/// Variables are numbered so that each attribute's variable index is its column index, and the
/// class is the last variable, at index [`Dataset::class_variable`]. The class variable's value
/// in a row is `Value::Number(class)`.
#[derive(Clone, Debug)]
pub struct Dataset {
    names: Vec<String>,
    class_names: Vec<String>,
    rows: Vec<Row>,
    class_values: Vec<Value>,
    domains: Vec<Domain>,
    /// Row-major level of every cell, `variable_count()` entries per row.
    levels: Vec<usize>,
}

impl Dataset {
    /// Builds a dataset and computes the domain of every variable.
    ///
    /// The `header` names every attribute and then the class column, so it must have one more
    /// entry than each row has values.
    ///
    /// ```
    /// use k2net::{Dataset, Row, Value};
    ///
    /// let data = Dataset::new(
    ///     vec!["color".into(), "ripe".into()],
    ///     vec!["no".into(), "yes".into()],
    ///     vec![
    ///         Row::new(vec![Value::from("green")], 0),
    ///         Row::new(vec![Value::from("red")], 1),
    ///         Row::new(vec![Value::from("red")], 1),
    ///     ],
    /// )
    /// .unwrap();
    /// assert_eq!(data.attribute_count(), 1);
    /// assert_eq!(data.variable_count(), 2);
    /// assert_eq!(data.domain(0).len(), 2);
    /// assert_eq!(data.value(2, data.class_variable()), &Value::Number(1.0));
    /// ```
    pub fn new(header: Vec<String>, class_names: Vec<String>, rows: Vec<Row>) -> Result<Self> {
        let attributes = header.len().checked_sub(1).ok_or(Error::MissingClassColumn)?;
        for (index, row) in rows.iter().enumerate() {
            if row.values.len() != attributes {
                return Err(Error::RowWidth {
                    row: index,
                    expected: attributes,
                    found: row.values.len(),
                });
            }
            if row.class >= class_names.len() {
                return Err(Error::UnknownClass {
                    row: index,
                    class: row.class,
                    classes: class_names.len(),
                });
            }
        }
        Ok(Dataset::index(header, class_names, rows))
    }

    /// Assumes the rows have already been validated against the header and class names.
    fn index(names: Vec<String>, class_names: Vec<String>, rows: Vec<Row>) -> Self {
        let variables = names.len();
        let class_values: Vec<Value> = (0..class_names.len())
            .map(|class| Value::Number(class as f64))
            .collect();

        let mut domains = vec![Domain::new(); variables];
        let mut levels = Vec::with_capacity(rows.len() * variables);
        for row in rows.iter() {
            let values = row.values.iter().chain(iter::once(&class_values[row.class]));
            for (domain, value) in domains.iter_mut().zip(values) {
                levels.push(domain.insert(value));
            }
        }

        Dataset {
            names,
            class_names,
            rows,
            class_values,
            domains,
            levels,
        }
    }

    /// Returns a new dataset containing only the given rows, in the given order, with every
    /// domain recomputed from just those rows.
    pub fn select<I: IntoIterator<Item = usize>>(&self, rows: I) -> Result<Self> {
        let rows = rows
            .into_iter()
            .map(|row| {
                self.rows.get(row).cloned().ok_or(Error::RowOutOfRange {
                    row,
                    rows: self.rows.len(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Dataset::index(
            self.names.clone(),
            self.class_names.clone(),
            rows,
        ))
    }

    /// The number of attribute columns, not counting the class.
    pub fn attribute_count(&self) -> usize {
        self.names.len() - 1
    }

    /// The number of network nodes: every attribute plus the class.
    pub fn variable_count(&self) -> usize {
        self.names.len()
    }

    /// The variable index of the class node.
    pub fn class_variable(&self) -> usize {
        self.attribute_count()
    }

    /// The number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// The rows, in their original order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// The name of each class, indexed by class.
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// The column name of a variable; the class variable is named by the last header entry.
    pub fn variable_name(&self, variable: usize) -> &str {
        &self.names[variable]
    }

    /// The distinct values of a variable.
    pub fn domain(&self, variable: usize) -> &Domain {
        &self.domains[variable]
    }

    /// The value of a variable in a row. For the class variable this is the class as a number.
    ///
    /// # Panics
    ///
    /// Panics if `row` or `variable` is out of range.
    pub fn value(&self, row: usize, variable: usize) -> &Value {
        let row = &self.rows[row];
        if variable == self.class_variable() {
            &self.class_values[row.class]
        } else {
            &row.values[variable]
        }
    }

    /// The position of a cell's value within its variable's domain.
    ///
    /// # Panics
    ///
    /// Panics if `row` or `variable` is out of range.
    pub fn level(&self, row: usize, variable: usize) -> usize {
        let variables = self.variable_count();
        assert!(
            variable < variables,
            "variable {} out of range for {} variables",
            variable,
            variables
        );
        self.levels[row * variables + variable]
    }

    /// Returns an error unless `variable` names a variable of this dataset.
    pub fn check_variable(&self, variable: usize) -> Result<()> {
        if variable < self.variable_count() {
            Ok(())
        } else {
            Err(Error::VariableOutOfRange {
                variable,
                variables: self.variable_count(),
            })
        }
    }

    /// Returns the indices of every row whose value at each of `indices` equals the
    /// corresponding entry of `values`.
    ///
    /// With no indices, every row matches.
    ///
    /// ```
    /// use k2net::{Dataset, Error, Row, Value};
    ///
    /// let data = Dataset::new(
    ///     vec!["a".into(), "b".into(), "class".into()],
    ///     vec!["only".into()],
    ///     vec![
    ///         Row::new(vec![Value::Number(0.0), Value::Number(1.0)], 0),
    ///         Row::new(vec![Value::Number(1.0), Value::Number(1.0)], 0),
    ///     ],
    /// )
    /// .unwrap();
    /// assert_eq!(data.matching_rows(&[1], &[Value::Number(1.0)]), Ok(vec![0, 1]));
    /// assert_eq!(
    ///     data.matching_rows(&[0, 1], &[Value::Number(1.0)]),
    ///     Err(Error::MismatchedLengths { expected: 2, found: 1 })
    /// );
    /// ```
    pub fn matching_rows<V: Borrow<Value>>(
        &self,
        indices: &[usize],
        values: &[V],
    ) -> Result<Vec<usize>> {
        if indices.len() != values.len() {
            return Err(Error::MismatchedLengths {
                expected: indices.len(),
                found: values.len(),
            });
        }
        for &variable in indices {
            self.check_variable(variable)?;
        }
        Ok((0..self.row_count())
            .filter(|&row| {
                indices
                    .iter()
                    .zip(values)
                    .all(|(&variable, value)| self.value(row, variable) == value.borrow())
            })
            .collect())
    }

    /// Estimates the probability that `variable` takes `value` among the rows matching the given
    /// values, without smoothing.
    ///
    /// If no row matches the condition, this falls back to the unconditional probability over
    /// every row.
    pub fn conditional_probability<V: Borrow<Value>>(
        &self,
        variable: usize,
        value: &Value,
        given_indices: &[usize],
        given_values: &[V],
    ) -> Result<f64> {
        self.check_variable(variable)?;
        if self.rows.is_empty() {
            return Err(Error::EmptyTrainingSet);
        }
        let mut slice = self.matching_rows(given_indices, given_values)?;
        if slice.is_empty() {
            slice = (0..self.row_count()).collect();
        }
        let count = slice
            .iter()
            .filter(|&&row| self.value(row, variable) == value)
            .count();
        Ok(count as f64 / slice.len() as f64)
    }
}

/// Returns the natural logarithm of `n!`.
///
/// This is a running sum of logarithms, so it never overflows the way computing the factorial
/// itself would for any realistic row count.
///
/// ```
/// use k2net::log_factorial;
///
/// assert_eq!(log_factorial(0), 0.0);
/// assert_eq!(log_factorial(1), 0.0);
/// assert!((log_factorial(4) - 24f64.ln()).abs() < 1e-12);
/// assert!(log_factorial(10_000).is_finite());
/// ```
pub fn log_factorial(n: usize) -> f64 {
    (2..=n).map(|k| (k as f64).ln()).sum()
}

/// A precomputed table of [`log_factorial`] values, built from the same running sum.
///
/// Scoring asks for log-factorials of counts over and over, so it pays to compute the prefix sums
/// once per dataset.
#[derive(Clone, Debug)]
pub struct LogFactorial(Vec<f64>);

impl LogFactorial {
    /// Precomputes `log_factorial(n)` for every `n` up to and including `max`.
    pub fn new(max: usize) -> Self {
        let mut table = Vec::with_capacity(max + 1);
        let mut sum = 0.0;
        table.push(sum);
        for k in 1..=max {
            sum += (k as f64).ln();
            table.push(sum);
        }
        LogFactorial(table)
    }

    /// Returns `log_factorial(n)`, continuing the running sum past the end of the table if needed.
    pub fn get(&self, n: usize) -> f64 {
        match self.0.get(n) {
            Some(&value) => value,
            None => {
                let last = self.0.len() - 1;
                self.0[last] + ((last + 1)..=n).map(|k| (k as f64).ln()).sum::<f64>()
            }
        }
    }
}

/// Computes K2 scores for variables of one dataset.
pub struct Scorer<'a> {
    data: &'a Dataset,
    log_factorial: LogFactorial,
}

impl<'a> Scorer<'a> {
    /// Prepares to score variables of the given dataset.
    pub fn new(data: &'a Dataset) -> Scorer<'a> {
        // The largest argument ever needed is N_ij + r_i - 1, and N_ij is at most the row count.
        let widest = (0..data.variable_count())
            .map(|variable| data.domain(variable).len())
            .max()
            .unwrap_or(0);
        Scorer {
            data,
            log_factorial: LogFactorial::new(data.row_count() + widest),
        }
    }

    /// The dataset being scored.
    pub fn data(&self) -> &'a Dataset {
        self.data
    }

    /// Returns the K2 score, on a natural-log scale, of `variable` having exactly the given
    /// parents.
    ///
    /// Scores are only meaningful relative to other scores of the same variable in the same
    /// dataset. A variable with fewer than two distinct values always scores 0.
    pub fn score(&self, variable: usize, parents: &[usize]) -> Result<f64> {
        let data = self.data;
        data.check_variable(variable)?;
        for &parent in parents {
            data.check_variable(parent)?;
            if parent == variable {
                return Err(Error::SelfParent(variable));
            }
        }

        let r = data.domain(variable).len();
        if r < 2 {
            return Ok(0.0);
        }

        // Cooper and Herskovits show that, under uniform priors, the probability of the data
        // given that `variable` has these parents is proportional to
        //
        // product over instantiations j of ((r-1)! / (N_ij + r - 1)!) * product over k of N_ijk!
        //
        // where j ranges over every combination of parent values, N_ijk counts the rows matching
        // instantiation j that have the k'th value of this variable, and N_ij sums N_ijk over k.
        // Taking logs turns every product into a sum and every factorial into a log-factorial.
        //
        // An instantiation no row matches has N_ij = 0, so its term is log((r-1)!/(r-1)!) = 0 and
        // only observed instantiations are visited. Tally N_ijk in one pass over the rows, keyed
        // by the parents' levels in a sorted map so the terms are always added in the same order.
        let mut counts: BTreeMap<Levels, Vec<usize>> = BTreeMap::new();
        for row in 0..data.row_count() {
            let key: Levels = parents.iter().map(|&p| data.level(row, p)).collect();
            counts.entry(key).or_insert_with(|| vec![0; r])[data.level(row, variable)] += 1;
        }

        let lf = &self.log_factorial;
        let mut score = 0.0;
        for n_ijk in counts.values() {
            let n_ij: usize = n_ijk.iter().sum();
            let sum_k: f64 = n_ijk.iter().map(|&n| lf.get(n)).sum();
            score += lf.get(r - 1) - lf.get(n_ij + r - 1) + sum_k;
        }
        Ok(score)
    }

    /// Returns the sum of every variable's K2 score under the parents the network assigns it.
    ///
    /// This is what competing networks for the same dataset are compared by.
    pub fn score_network(&self, network: &Network) -> Result<f64> {
        if network.variable_count() != self.data.variable_count() {
            return Err(Error::NetworkSize {
                expected: self.data.variable_count(),
                found: network.variable_count(),
            });
        }
        network
            .iter()
            .map(|(variable, parents)| self.score(variable, parents.as_slice()))
            .sum()
    }
}

/// The parents chosen for one variable, in the order they were chosen.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct ParentSet(Levels);

impl ParentSet {
    /// Creates an empty parent set.
    pub fn new() -> Self {
        ParentSet(SmallVec::new())
    }

    /// The number of parents.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no parents.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns `true` if `variable` is one of the parents.
    pub fn contains(&self, variable: usize) -> bool {
        self.0.contains(&variable)
    }

    /// The parents' variable indices.
    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Iterates over the parents' variable indices.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    fn push(&mut self, variable: usize) {
        self.0.push(variable);
    }

    /// Returns a copy of this set with one more parent on the end.
    fn with(&self, variable: usize) -> ParentSet {
        let mut extended = self.clone();
        extended.push(variable);
        extended
    }
}

impl iter::FromIterator<usize> for ParentSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        ParentSet(SmallVec::from_iter(iter))
    }
}

/// A network structure: the parent set of every variable.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Network {
    parents: Vec<ParentSet>,
}

impl Network {
    /// Creates a network from one parent set per variable.
    ///
    /// Every parent must be a valid variable other than the one it's a parent of. Cycles are not
    /// checked for; networks produced by [`learn`] can't contain any.
    pub fn new(parents: Vec<ParentSet>) -> Result<Self> {
        let variables = parents.len();
        for (variable, set) in parents.iter().enumerate() {
            for parent in set.iter() {
                if parent == variable {
                    return Err(Error::SelfParent(variable));
                }
                if parent >= variables {
                    return Err(Error::VariableOutOfRange {
                        variable: parent,
                        variables,
                    });
                }
            }
        }
        Ok(Network { parents })
    }

    /// Creates a network over `variables` variables where nothing has any parents.
    pub fn independent(variables: usize) -> Self {
        Network {
            parents: vec![ParentSet::new(); variables],
        }
    }

    /// The number of variables.
    pub fn variable_count(&self) -> usize {
        self.parents.len()
    }

    /// The parents of one variable.
    pub fn parents(&self, variable: usize) -> &ParentSet {
        &self.parents[variable]
    }

    /// Iterates over every variable along with its parents.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &ParentSet)> + '_ {
        self.parents.iter().enumerate()
    }
}

/// Whether a [`ParentSearch`] may still add parents.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchState {
    /// The last step added a parent and there's room for more.
    Growing,
    /// No candidate improves the score, or the parent set is full.
    Converged,
}

/// Greedy hill-climbing over the parent set of a single variable.
///
/// Each [`step`](ParentSearch::step) scores every remaining candidate appended to the current
/// parents and keeps the best one, but only if it strictly beats the current score. Candidates are
/// scanned in the order given, and when several reach the same best score the first one scanned
/// wins.
pub struct ParentSearch<'s, 'a> {
    scorer: &'s Scorer<'a>,
    variable: usize,
    candidates: Vec<usize>,
    max_parents: usize,
    parents: ParentSet,
    score: f64,
    state: SearchState,
}

impl<'s, 'a> ParentSearch<'s, 'a> {
    /// Starts a search for the parents of `variable`, choosing only among `candidates`, which are
    /// normally the variables that precede it in a topological ordering.
    pub fn new(
        scorer: &'s Scorer<'a>,
        variable: usize,
        candidates: &[usize],
        max_parents: usize,
    ) -> Result<Self> {
        let score = scorer.score(variable, &[])?;
        for &candidate in candidates {
            scorer.data().check_variable(candidate)?;
            if candidate == variable {
                return Err(Error::SelfParent(variable));
            }
        }
        let state = if max_parents == 0 || candidates.is_empty() {
            SearchState::Converged
        } else {
            SearchState::Growing
        };
        Ok(ParentSearch {
            scorer,
            variable,
            candidates: candidates.to_vec(),
            max_parents,
            parents: ParentSet::new(),
            score,
            state,
        })
    }

    /// Whether the search can continue.
    pub fn state(&self) -> SearchState {
        self.state
    }

    /// The parents chosen so far.
    pub fn parents(&self) -> &ParentSet {
        &self.parents
    }

    /// The score of the parents chosen so far.
    pub fn score(&self) -> f64 {
        self.score
    }

    /// Tries to add one more parent.
    pub fn step(&mut self) -> Result<SearchState> {
        if self.state == SearchState::Converged {
            return Ok(self.state);
        }

        let mut best: Option<(usize, f64)> = None;
        for &candidate in self.candidates.iter() {
            if self.parents.contains(candidate) {
                continue;
            }
            let trial = self.parents.with(candidate);
            let score = self.scorer.score(self.variable, trial.as_slice())?;
            if best.map_or(true, |(_, best_score)| score > best_score) {
                best = Some((candidate, score));
            }
        }

        self.state = match best {
            Some((candidate, score)) if score > self.score => {
                trace!(
                    variable = self.variable,
                    parent = candidate,
                    score,
                    "accepted parent"
                );
                self.parents.push(candidate);
                self.score = score;
                if self.parents.len() >= self.max_parents {
                    SearchState::Converged
                } else {
                    SearchState::Growing
                }
            }
            _ => SearchState::Converged,
        };
        Ok(self.state)
    }

    /// Steps until converged, and returns the final parents and their score.
    pub fn finish(mut self) -> Result<(ParentSet, f64)> {
        while self.step()? == SearchState::Growing {}
        Ok((self.parents, self.score))
    }
}

/// Which topological orderings [`learn`] tries.
#[derive(Clone, Debug, PartialEq)]
pub enum Orderings {
    /// Try this many uniformly random permutations and keep the best network.
    Random {
        /// The number of permutations to try.
        trials: usize,
    },
    /// Use the variables' own order, once.
    Fixed,
}

/// Settings for structure learning and prediction.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchConfig {
    /// The most parents any one variable may have. Scoring cost grows with the product of the
    /// parents' domain sizes, so keep this small.
    pub max_parents: usize,
    /// Which orderings to search under.
    pub orderings: Orderings,
    /// The m-estimate added to every count when a [`Predictor`] estimates probabilities.
    pub smoothing: f64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            max_parents: 2,
            orderings: Orderings::Random { trials: 10 },
            smoothing: 1.0,
        }
    }
}

impl SearchConfig {
    /// Rejects settings that can't produce a result.
    pub fn validate(&self) -> Result<()> {
        if self.orderings == (Orderings::Random { trials: 0 }) {
            return Err(Error::NoTrials);
        }
        check_smoothing(self.smoothing)
    }
}

fn check_smoothing(smoothing: f64) -> Result<()> {
    if smoothing.is_finite() && smoothing >= 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidSmoothing(smoothing))
    }
}

/// A network chosen by structure search, along with how it was found.
#[derive(Clone, Debug, PartialEq)]
pub struct LearnedNetwork {
    /// The parent sets.
    pub network: Network,
    /// The network's total K2 score.
    pub score: f64,
    /// The topological ordering the network was found under.
    pub ordering: Vec<usize>,
}

/// Runs K2 under one topological ordering: every variable picks its parents greedily from the
/// variables before it.
///
/// The per-variable searches don't depend on each other, so they run in parallel.
pub fn learn_with_ordering(
    scorer: &Scorer<'_>,
    ordering: &[usize],
    max_parents: usize,
) -> Result<LearnedNetwork> {
    let variables = scorer.data().variable_count();
    let mut seen = vec![false; variables];
    if ordering.len() != variables {
        return Err(Error::InvalidOrdering { variables });
    }
    for &variable in ordering {
        if variable >= variables || seen[variable] {
            return Err(Error::InvalidOrdering { variables });
        }
        seen[variable] = true;
    }

    let found = ordering
        .par_iter()
        .enumerate()
        .map(|(position, &variable)| {
            let search = ParentSearch::new(scorer, variable, &ordering[..position], max_parents)?;
            let (parents, score) = search.finish()?;
            Ok((variable, parents, score))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut parents = vec![ParentSet::new(); variables];
    let mut scores = vec![0.0; variables];
    for (variable, set, score) in found {
        parents[variable] = set;
        scores[variable] = score;
    }
    // Summed in variable order, exactly as `Scorer::score_network` would.
    let score = scores.iter().sum();
    let network = Network { parents };
    Ok(LearnedNetwork {
        network,
        score,
        ordering: ordering.to_vec(),
    })
}

/// Learns a network for the dataset, trying the orderings the configuration asks for and keeping
/// the best-scoring result.
///
/// All random orderings are drawn from `rng` before any searching starts, and ties go to the
/// earliest trial, so the result depends only on the data, the configuration, and the state of
/// `rng`, even though trials run in parallel.
///
/// ```
/// use k2net::rand::{rngs::StdRng, SeedableRng};
/// use k2net::{learn, Dataset, Row, SearchConfig, Value};
///
/// let rows = (0..20)
///     .map(|i| Row::new(vec![Value::Number((i % 2) as f64)], i % 2))
///     .collect();
/// let data = Dataset::new(vec!["bit".into(), "class".into()], vec!["even".into(), "odd".into()], rows)
///     .unwrap();
///
/// let mut rng = StdRng::seed_from_u64(7);
/// let learned = learn(&data, &SearchConfig::default(), &mut rng).unwrap();
///
/// // The class and the attribute determine each other, so one must be the other's parent.
/// let edges = learned.network.iter().map(|(_, parents)| parents.len()).sum::<usize>();
/// assert_eq!(edges, 1);
/// ```
pub fn learn<R: Rng + ?Sized>(
    data: &Dataset,
    config: &SearchConfig,
    rng: &mut R,
) -> Result<LearnedNetwork> {
    config.validate()?;
    let scorer = Scorer::new(data);
    let identity: Vec<usize> = (0..data.variable_count()).collect();
    let orderings: Vec<Vec<usize>> = match config.orderings {
        Orderings::Fixed => vec![identity],
        Orderings::Random { trials } => (0..trials)
            .map(|_| {
                let mut ordering = identity.clone();
                ordering.shuffle(&mut *rng);
                ordering
            })
            .collect(),
    };

    let results = orderings
        .into_par_iter()
        .map(|ordering| learn_with_ordering(&scorer, &ordering, config.max_parents))
        .collect::<Result<Vec<_>>>()?;

    let mut best: Option<LearnedNetwork> = None;
    for (trial, result) in results.into_iter().enumerate() {
        debug!(trial, score = result.score, ordering = ?result.ordering, "finished trial");
        if best.as_ref().map_or(true, |best| result.score > best.score) {
            best = Some(result);
        }
    }
    // Validation guarantees at least one trial.
    let best = best.ok_or(Error::NoTrials)?;
    info!(score = best.score, "selected network");
    Ok(best)
}

/// One row of a [`ConditionalTable`].
#[derive(Clone, Debug, PartialEq)]
pub struct TableEntry {
    /// The parents' values, in parent order.
    pub instantiation: Vec<Value>,
    /// How many training rows matched the instantiation.
    pub rows: usize,
    /// The smoothed probability of each value in the variable's domain.
    pub probabilities: Vec<f64>,
}

/// The estimated distribution of one variable for every instantiation of its parents.
#[derive(Clone, Debug, PartialEq)]
pub struct ConditionalTable {
    /// The variable being described.
    pub variable: usize,
    /// Its parents, in the order the entries' instantiations list them.
    pub parents: ParentSet,
    /// One entry per combination of parent values.
    pub entries: Vec<TableEntry>,
}

/// Classifies rows using a network and the rows it was learned from.
///
/// Each variable's probability given its parents is estimated directly from the training rows,
/// with additive smoothing: `(count + m / r) / (matching + m)` where `m` is the smoothing
/// constant, `r` is the size of the variable's domain, and `matching` is the number of training
/// rows that agree with the query on the variable's parents. When no training row agrees, every
/// training row is used instead.
pub struct Predictor<'a> {
    data: &'a Dataset,
    network: &'a Network,
    smoothing: f64,
}

impl<'a> Predictor<'a> {
    /// Prepares to classify with the given network and training data.
    ///
    /// Fails if the smoothing constant is negative or not finite, or if there are no training
    /// rows, since either would allow a zero denominator.
    pub fn new(data: &'a Dataset, network: &'a Network, smoothing: f64) -> Result<Self> {
        check_smoothing(smoothing)?;
        if data.row_count() == 0 {
            return Err(Error::EmptyTrainingSet);
        }
        if network.variable_count() != data.variable_count() {
            return Err(Error::NetworkSize {
                expected: data.variable_count(),
                found: network.variable_count(),
            });
        }
        Ok(Predictor {
            data,
            network,
            smoothing,
        })
    }

    /// Returns, for each class, the natural log of the product of every variable's estimated
    /// probability given its parents, with the query completed by that class.
    ///
    /// These are unnormalized; only their order matters. A class is `-inf` only if some estimate
    /// was exactly zero, which needs a smoothing constant of zero.
    pub fn class_scores(&self, values: &[Value]) -> Result<Vec<f64>> {
        let data = self.data;
        if values.len() != data.attribute_count() {
            return Err(Error::MismatchedLengths {
                expected: data.attribute_count(),
                found: values.len(),
            });
        }

        let unknown = Value::Wildcard;
        let mut query: Vec<&Value> = values.iter().chain(iter::once(&unknown)).collect();
        let class_variable = data.class_variable();

        let mut scores = Vec::with_capacity(data.class_names().len());
        for class_value in data.class_values.iter() {
            query[class_variable] = class_value;
            let mut score = 0.0;
            for (variable, parents) in self.network.iter() {
                let given: Vec<&Value> = parents.iter().map(|parent| query[parent]).collect();
                let subset = self.conditioning_rows(parents, &given)?;
                score += self.estimate(variable, query[variable], &subset).ln();
            }
            scores.push(score);
        }
        Ok(scores)
    }

    /// Returns the most probable class for the given attribute values, or `None` if no class has
    /// a non-zero probability.
    ///
    /// When classes tie, the one with the lowest index wins.
    pub fn predict(&self, values: &[Value]) -> Result<Option<usize>> {
        let mut best: Option<(usize, f64)> = None;
        for (class, score) in self.class_scores(values)?.into_iter().enumerate() {
            let floor = best.map_or(f64::NEG_INFINITY, |(_, best)| best);
            if score > floor {
                best = Some((class, score));
            }
        }
        Ok(best.map(|(class, _)| class))
    }

    /// Builds the conditional probability table of one variable.
    pub fn table(&self, variable: usize) -> Result<ConditionalTable> {
        let data = self.data;
        data.check_variable(variable)?;
        let parents = self.network.parents(variable).clone();
        let domains: Vec<&[Value]> = parents
            .iter()
            .map(|parent| data.domain(parent).values())
            .collect();

        let entries = cartesian_product(&domains)
            .map(|instantiation| {
                let subset = self.conditioning_rows(&parents, &instantiation)?;
                let probabilities = data
                    .domain(variable)
                    .values()
                    .iter()
                    .map(|value| self.estimate(variable, value, &subset))
                    .collect();
                Ok(TableEntry {
                    instantiation: instantiation.into_iter().cloned().collect(),
                    rows: subset.len(),
                    probabilities,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ConditionalTable {
            variable,
            parents,
            entries,
        })
    }

    /// Builds the conditional probability table of every variable.
    pub fn tables(&self) -> Result<Vec<ConditionalTable>> {
        (0..self.data.variable_count())
            .map(|variable| self.table(variable))
            .collect()
    }

    fn conditioning_rows(&self, parents: &ParentSet, given: &[&Value]) -> Result<Vec<usize>> {
        let subset = self.data.matching_rows(parents.as_slice(), given)?;
        if subset.is_empty() {
            Ok((0..self.data.row_count()).collect())
        } else {
            Ok(subset)
        }
    }

    fn estimate(&self, variable: usize, value: &Value, subset: &[usize]) -> f64 {
        let data = self.data;
        let tally = subset
            .iter()
            .filter(|&&row| data.value(row, variable) == value)
            .count();
        // Training data is never empty, so every domain has at least one value.
        let prior = self.smoothing / data.domain(variable).len() as f64;
        (tally as f64 + prior) / (subset.len() as f64 + self.smoothing)
    }
}
