//! Fragment graph → statements
//!
//! Each output query gets the transitive closure of the fragments it reads,
//! rendered as a `WITH` chain in dependency order. Ties are broken by
//! declaration order so the text is stable across runs.

use super::{ExecutionPlan, Phase, PlanStep, StepKind};
use crate::config::ExecutionMode;
use crate::dialect::DialectCapabilities;
use crate::fragment::{AnalysisQuery, Fragment, PlanFragments, UNITS};
use crate::{Error, Result};
use daggy::{Dag, NodeIndex, Walker};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use tracing::debug;

/// Fragments visible to one statement, by name
struct FragmentPool<'a> {
    fragments: Vec<&'a Fragment>,
    by_name: HashMap<&'a str, usize>,
}

impl<'a> FragmentPool<'a> {
    fn new<I>(fragments: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a Fragment>,
    {
        let mut pool = Self {
            fragments: Vec::new(),
            by_name: HashMap::new(),
        };
        for fragment in fragments {
            match pool.by_name.get(fragment.name.as_str()) {
                Some(&existing) if pool.fragments[existing] == fragment => {}
                Some(_) => {
                    return Err(Error::Assembly(format!(
                        "relation '{}' is defined more than once",
                        fragment.name
                    )))
                }
                None => {
                    pool.by_name.insert(fragment.name.as_str(), pool.fragments.len());
                    pool.fragments.push(fragment);
                }
            }
        }
        Ok(pool)
    }

    /// Pool indices reachable from `roots`, in declaration order
    fn closure(&self, reader: &str, roots: &[String]) -> Result<Vec<usize>> {
        let mut seen = vec![false; self.fragments.len()];
        let mut stack: Vec<(&str, &str)> = roots.iter().map(|r| (reader, r.as_str())).collect();
        while let Some((from, name)) = stack.pop() {
            let &index = self.by_name.get(name).ok_or_else(|| {
                Error::Assembly(format!("'{from}' references undefined relation '{name}'"))
            })?;
            if seen[index] {
                continue;
            }
            seen[index] = true;
            let fragment = self.fragments[index];
            stack.extend(fragment.depends_on.iter().map(|d| (fragment.name.as_str(), d.as_str())));
        }
        Ok((0..self.fragments.len()).filter(|&i| seen[i]).collect())
    }

    /// `WITH` clause for a statement reading `roots`
    fn with_clause(&self, reader: &str, roots: &[String]) -> Result<String> {
        let members = self.closure(reader, roots)?;
        if members.is_empty() {
            return Ok(String::new());
        }

        let mut dag: Dag<usize, ()> = Dag::with_capacity(members.len(), members.len());
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::with_capacity(members.len());
        for &member in &members {
            nodes.insert(self.fragments[member].name.as_str(), dag.add_node(member));
        }
        for &member in &members {
            let fragment = self.fragments[member];
            let to = nodes[fragment.name.as_str()];
            for dependency in &fragment.depends_on {
                let from = nodes[dependency.as_str()];
                dag.add_edge(from, to, ()).map_err(|_| {
                    Error::Assembly(format!(
                        "dependency cycle: '{}' depends on '{dependency}'",
                        fragment.name
                    ))
                })?;
            }
        }

        // Kahn's algorithm, smallest declaration index first
        let mut in_degree: Vec<usize> = vec![0; dag.node_count()];
        for edge in dag.raw_edges() {
            in_degree[edge.target().index()] += 1;
        }
        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = dag
            .graph()
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .map(|n| Reverse((dag[n], n.index())))
            .collect();
        let mut ordered = Vec::with_capacity(members.len());
        while let Some(Reverse((member, node))) = ready.pop() {
            ordered.push(self.fragments[member]);
            let node = NodeIndex::new(node);
            for (_, child) in dag.children(node).iter(&dag) {
                in_degree[child.index()] -= 1;
                if in_degree[child.index()] == 0 {
                    ready.push(Reverse((dag[child], child.index())));
                }
            }
        }

        let ctes: Vec<String> = ordered
            .iter()
            .map(|f| format!("{} AS (\n{}\n)", f.name, indent(&f.sql)))
            .collect();
        Ok(format!("WITH\n{}\n", ctes.join(",\n")))
    }
}

fn indent(sql: &str) -> String {
    sql.lines()
        .map(|line| if line.is_empty() { String::new() } else { format!("  {line}") })
        .collect::<Vec<_>>()
        .join("\n")
}

fn analysis_step(query: &AnalysisQuery, pool: &FragmentPool<'_>) -> Result<PlanStep> {
    let name = query.kind.step_name();
    let with = pool.with_clause(&name, &query.depends_on)?;
    Ok(PlanStep {
        name,
        phase: Phase::Analysis,
        kind: query.kind.clone(),
        sql: format!("{with}{}", query.select),
        columns: query.columns.clone(),
        materializes: None,
    })
}

/// Assemble fragments into an execution plan
///
/// # Errors
///
/// Returns [`Error::Assembly`] when fragments form a cycle, reference an
/// undefined relation, or define the same name twice with different text.
pub fn assemble(
    fragments: &PlanFragments,
    mode: &ExecutionMode,
    caps: &DialectCapabilities,
) -> Result<ExecutionPlan> {
    let mut steps = Vec::with_capacity(fragments.analyses.len() + 2);
    match mode {
        ExecutionMode::SinglePass => {
            for query in &fragments.analyses {
                let pool = FragmentPool::new(fragments.units.iter().chain(&query.fragments))?;
                steps.push(analysis_step(query, &pool)?);
            }
        }
        ExecutionMode::Incremental { units_table } => {
            let units = FragmentPool::new(&fragments.units)?;
            let body = format!(
                "{}SELECT * FROM {UNITS}",
                units.with_clause("materialize_units", &[UNITS.to_string()])?
            );
            let mut statements = caps.create_table_as(units_table, &body);
            let create = statements.pop().ok_or_else(|| {
                Error::Assembly(format!("dialect {} produced no create statement", caps.id))
            })?;
            for drop in statements {
                steps.push(PlanStep {
                    name: StepKind::DropUnits.step_name(),
                    phase: Phase::Units,
                    kind: StepKind::DropUnits,
                    sql: drop,
                    columns: Vec::new(),
                    materializes: None,
                });
            }
            steps.push(PlanStep {
                name: StepKind::MaterializeUnits.step_name(),
                phase: Phase::Units,
                kind: StepKind::MaterializeUnits,
                sql: create,
                columns: Vec::new(),
                materializes: Some(units_table.clone()),
            });

            let materialized = Fragment::new(
                UNITS,
                format!("SELECT * FROM {}", caps.quote_relation(units_table)),
                Vec::<String>::new(),
            );
            for query in &fragments.analyses {
                let pool = FragmentPool::new(std::iter::once(&materialized).chain(&query.fragments))?;
                steps.push(analysis_step(query, &pool)?);
            }
        }
    }

    let mut names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    names.sort_unstable();
    if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
        return Err(Error::Assembly(format!("duplicate plan step '{}'", pair[0])));
    }

    debug!(
        dialect = %caps.id,
        steps = steps.len(),
        "assembled execution plan"
    );
    Ok(ExecutionPlan {
        dialect: caps.id,
        mode: mode.clone(),
        steps,
    })
}
