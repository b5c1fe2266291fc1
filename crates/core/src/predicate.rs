/*
 * Partition-predicate planning.
 *
 * Splits a filter expression into partition predicates (evaluable against a
 * descriptor's column map) and data predicates (forwarded to the IO layer),
 * then picks the cheapest catalog access path for the partition side.
 *
 * Values compare as strings. Descriptor values are strings by construction,
 * and the catalog's equality index is string-keyed, so anything fancier
 * belongs to the engine binding that produced the expression.
 */

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use lakestate_catalog::{PartitionDesc, PartitionInfo};
use lakestate_common::{LakeStateError, Result};

/// Boolean expression over named columns.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Predicate {
    True,
    False,
    Eq(String, String),
    NotEq(String, String),
    Lt(String, String),
    LtEq(String, String),
    Gt(String, String),
    GtEq(String, String),
    In(String, Vec<String>),
    IsNull(String),
    IsNotNull(String),
    Not(Box<Predicate>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    /// Every column the expression references.
    pub fn columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Predicate::True | Predicate::False => {}
            Predicate::Eq(c, _)
            | Predicate::NotEq(c, _)
            | Predicate::Lt(c, _)
            | Predicate::LtEq(c, _)
            | Predicate::Gt(c, _)
            | Predicate::GtEq(c, _)
            | Predicate::In(c, _)
            | Predicate::IsNull(c)
            | Predicate::IsNotNull(c) => {
                out.insert(c.clone());
            }
            Predicate::Not(inner) => inner.collect_columns(out),
            Predicate::And(parts) | Predicate::Or(parts) => {
                for p in parts {
                    p.collect_columns(out);
                }
            }
        }
    }

    /// True when every referenced column is in `cols`.
    pub fn references_only(&self, cols: &[String]) -> bool {
        self.columns().iter().all(|c| cols.contains(c))
    }

    /// Evaluates against a column -> value map. A missing column is null.
    pub fn eval(&self, values: &HashMap<String, String>) -> bool {
        match self {
            Predicate::True => true,
            Predicate::False => false,
            Predicate::Eq(c, v) => values.get(c).map(|x| x == v).unwrap_or(false),
            Predicate::NotEq(c, v) => values.get(c).map(|x| x != v).unwrap_or(false),
            Predicate::Lt(c, v) => values.get(c).map(|x| x.as_str() < v.as_str()).unwrap_or(false),
            Predicate::LtEq(c, v) => values.get(c).map(|x| x.as_str() <= v.as_str()).unwrap_or(false),
            Predicate::Gt(c, v) => values.get(c).map(|x| x.as_str() > v.as_str()).unwrap_or(false),
            Predicate::GtEq(c, v) => values.get(c).map(|x| x.as_str() >= v.as_str()).unwrap_or(false),
            Predicate::In(c, options) => values
                .get(c)
                .map(|x| options.contains(x))
                .unwrap_or(false),
            Predicate::IsNull(c) => !values.contains_key(c),
            Predicate::IsNotNull(c) => values.contains_key(c),
            Predicate::Not(inner) => !inner.eval(values),
            Predicate::And(parts) => parts.iter().all(|p| p.eval(values)),
            Predicate::Or(parts) => parts.iter().any(|p| p.eval(values)),
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::True => write!(f, "TRUE"),
            Predicate::False => write!(f, "FALSE"),
            Predicate::Eq(c, v) => write!(f, "{c} = '{v}'"),
            Predicate::NotEq(c, v) => write!(f, "{c} <> '{v}'"),
            Predicate::Lt(c, v) => write!(f, "{c} < '{v}'"),
            Predicate::LtEq(c, v) => write!(f, "{c} <= '{v}'"),
            Predicate::Gt(c, v) => write!(f, "{c} > '{v}'"),
            Predicate::GtEq(c, v) => write!(f, "{c} >= '{v}'"),
            Predicate::In(c, options) => {
                write!(f, "{c} IN (")?;
                for (i, v) in options.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "'{v}'")?;
                }
                write!(f, ")")
            }
            Predicate::IsNull(c) => write!(f, "{c} IS NULL"),
            Predicate::IsNotNull(c) => write!(f, "{c} IS NOT NULL"),
            Predicate::Not(inner) => write!(f, "NOT ({inner})"),
            Predicate::And(parts) => join_parts(f, parts, " AND "),
            Predicate::Or(parts) => join_parts(f, parts, " OR "),
        }
    }
}

fn join_parts(f: &mut fmt::Formatter<'_>, parts: &[Predicate], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, p) in parts.iter().enumerate() {
        if i > 0 {
            f.write_str(sep)?;
        }
        write!(f, "{p}")?;
    }
    write!(f, ")")
}

/// Filters split by which side consumes them.
#[derive(Debug, Clone, Default)]
pub struct SplitFilters {
    /// Evaluable against the partition descriptor; drives catalog access.
    pub partition: Vec<Predicate>,
    /// Forwarded untouched to the IO layer.
    pub data: Vec<Predicate>,
}

/// Splits top-level conjuncts: a conjunct is a partition predicate iff every
/// column it references is a range-partition column.
pub fn split_filters(filters: &[Predicate], range_cols: &[String]) -> SplitFilters {
    let mut split = SplitFilters::default();
    for filter in filters {
        for conjunct in flatten_and(filter) {
            if conjunct.references_only(range_cols) {
                split.partition.push(conjunct);
            } else {
                split.data.push(conjunct);
            }
        }
    }
    split.partition = drop_trivial(split.partition);
    split
}

fn flatten_and(p: &Predicate) -> Vec<Predicate> {
    match p {
        Predicate::And(parts) => parts.iter().flat_map(flatten_and).collect(),
        other => vec![other.clone()],
    }
}

/// Removes `TRUE` and any `IS NOT NULL` on a column already bound by
/// equality.
fn drop_trivial(preds: Vec<Predicate>) -> Vec<Predicate> {
    let bound: BTreeSet<&str> = preds
        .iter()
        .filter_map(|p| match p {
            Predicate::Eq(c, _) => Some(c.as_str()),
            _ => None,
        })
        .collect();
    preds
        .iter()
        .filter(|p| match p {
            Predicate::True => false,
            Predicate::IsNotNull(c) => !bound.contains(c.as_str()),
            _ => true,
        })
        .cloned()
        .collect()
}

/// The catalog access path chosen for a partition-predicate set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogAccessPath {
    /// All-equality covering every range column: one descriptor lookup.
    SinglePartition(PartitionDesc),
    /// Pure equalities over a subset of range columns: server-side index.
    EqualityQuery(Vec<(String, String)>),
    /// Enumerate and evaluate client-side.
    FullList,
    /// Contradictory equalities; no partition can match.
    Empty,
}

/// Classifies partition predicates per the access-path rules.
///
/// Callers must pass predicates that came out of [`split_filters`]; a
/// predicate referencing a non-partition column here is an invalid state,
/// not a planning choice.
pub fn classify(partition_preds: &[Predicate], range_cols: &[String]) -> Result<CatalogAccessPath> {
    for p in partition_preds {
        if !p.references_only(range_cols) {
            return Err(LakeStateError::InvalidState(format!(
                "partition predicate references non-partition column: {p}"
            )));
        }
    }

    let mut bindings: HashMap<&str, &str> = HashMap::new();
    let mut all_equality = true;
    for p in partition_preds {
        match p {
            Predicate::Eq(c, v) => match bindings.get(c.as_str()) {
                Some(existing) if *existing != v.as_str() => {
                    return Ok(CatalogAccessPath::Empty);
                }
                _ => {
                    bindings.insert(c.as_str(), v.as_str());
                }
            },
            Predicate::False => return Ok(CatalogAccessPath::Empty),
            _ => all_equality = false,
        }
    }

    if !all_equality || bindings.is_empty() {
        return Ok(CatalogAccessPath::FullList);
    }

    if range_cols.iter().all(|c| bindings.contains_key(c.as_str())) {
        let desc = PartitionDesc::from_pairs(
            range_cols
                .iter()
                .map(|c| (c.as_str(), bindings[c.as_str()])),
        );
        return Ok(CatalogAccessPath::SinglePartition(desc));
    }

    // Keep the query in declared column order for a stable wire shape.
    let query = range_cols
        .iter()
        .filter_map(|c| {
            bindings
                .get(c.as_str())
                .map(|v| (c.clone(), (*v).to_string()))
        })
        .collect();
    Ok(CatalogAccessPath::EqualityQuery(query))
}

/// Client-side evaluation over partition heads, deduplicated by descriptor
/// string only (descriptor values are not guaranteed comparable as rows).
pub fn evaluate_partitions(
    preds: &[Predicate],
    partitions: Vec<PartitionInfo>,
) -> Result<Vec<PartitionInfo>> {
    let mut seen = BTreeSet::new();
    let mut selected = Vec::new();
    for partition in partitions {
        if !seen.insert(partition.partition_desc.as_str().to_string()) {
            continue;
        }
        let values = partition.partition_desc.values()?;
        if preds.iter().all(|p| p.eval(&values)) {
            selected.push(partition);
        }
    }
    Ok(selected)
}

/// Stable cache key for a partition-predicate set: sorted canonical forms.
pub fn canonical_key(preds: &[Predicate]) -> String {
    let mut parts: Vec<String> = preds.iter().map(|p| p.to_string()).collect();
    parts.sort();
    parts.join(" AND ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_cols() -> Vec<String> {
        vec!["region".to_string(), "dt".to_string()]
    }

    #[test]
    fn test_split_partition_vs_data() {
        let filters = vec![Predicate::And(vec![
            Predicate::Eq("region".into(), "us".into()),
            Predicate::Gt("amount".into(), "100".into()),
        ])];
        let split = split_filters(&filters, &range_cols());
        assert_eq!(split.partition, vec![Predicate::Eq("region".into(), "us".into())]);
        assert_eq!(split.data, vec![Predicate::Gt("amount".into(), "100".into())]);
    }

    #[test]
    fn test_trivial_predicates_dropped() {
        let filters = vec![
            Predicate::True,
            Predicate::Eq("region".into(), "us".into()),
            Predicate::IsNotNull("region".into()),
            Predicate::IsNotNull("dt".into()),
        ];
        let split = split_filters(&filters, &range_cols());
        assert_eq!(
            split.partition,
            vec![
                Predicate::Eq("region".into(), "us".into()),
                Predicate::IsNotNull("dt".into()),
            ]
        );
    }

    #[test]
    fn test_classify_single_partition() {
        let preds = vec![
            Predicate::Eq("region".into(), "us".into()),
            Predicate::Eq("dt".into(), "2024-01-01".into()),
        ];
        let path = classify(&preds, &range_cols()).unwrap();
        assert_eq!(
            path,
            CatalogAccessPath::SinglePartition(PartitionDesc::from("region=us,dt=2024-01-01"))
        );
    }

    #[test]
    fn test_classify_equality_query() {
        let preds = vec![Predicate::Eq("region".into(), "us".into())];
        let path = classify(&preds, &range_cols()).unwrap();
        assert_eq!(
            path,
            CatalogAccessPath::EqualityQuery(vec![("region".to_string(), "us".to_string())])
        );
    }

    #[test]
    fn test_classify_inequality_lists_all() {
        let preds = vec![Predicate::Gt("dt".into(), "2024-01-01".into())];
        assert_eq!(classify(&preds, &range_cols()).unwrap(), CatalogAccessPath::FullList);
    }

    #[test]
    fn test_classify_disjunction_lists_all() {
        let preds = vec![Predicate::Or(vec![
            Predicate::Eq("region".into(), "us".into()),
            Predicate::Eq("region".into(), "eu".into()),
        ])];
        assert_eq!(classify(&preds, &range_cols()).unwrap(), CatalogAccessPath::FullList);
    }

    #[test]
    fn test_classify_contradiction() {
        let preds = vec![
            Predicate::Eq("region".into(), "us".into()),
            Predicate::Eq("region".into(), "eu".into()),
        ];
        assert_eq!(classify(&preds, &range_cols()).unwrap(), CatalogAccessPath::Empty);
    }

    #[test]
    fn test_classify_rejects_foreign_column() {
        let preds = vec![Predicate::Eq("amount".into(), "1".into())];
        assert!(matches!(
            classify(&preds, &range_cols()),
            Err(LakeStateError::InvalidState(_))
        ));
    }

    #[test]
    fn test_eval_against_descriptor() {
        let values: HashMap<String, String> = PartitionDesc::from("region=us,dt=2024-01-02")
            .values()
            .unwrap();

        assert!(Predicate::Eq("region".into(), "us".into()).eval(&values));
        assert!(Predicate::Gt("dt".into(), "2024-01-01".into()).eval(&values));
        assert!(!Predicate::Gt("dt".into(), "2024-01-02".into()).eval(&values));
        assert!(Predicate::IsNull("missing".into()).eval(&values));
        assert!(Predicate::Or(vec![
            Predicate::Eq("region".into(), "eu".into()),
            Predicate::Eq("region".into(), "us".into()),
        ])
        .eval(&values));
    }

    #[test]
    fn test_canonical_key_order_independent() {
        let a = vec![
            Predicate::Eq("region".into(), "us".into()),
            Predicate::Gt("dt".into(), "2024".into()),
        ];
        let b = vec![
            Predicate::Gt("dt".into(), "2024".into()),
            Predicate::Eq("region".into(), "us".into()),
        ];
        assert_eq!(canonical_key(&a), canonical_key(&b));
    }
}
