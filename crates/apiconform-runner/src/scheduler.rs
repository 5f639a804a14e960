//! Execution scheduler
//!
//! Groups form a forest through `depends_on`. Roots run concurrently, each
//! on its own scoped thread; when a group finishes, its dependents run
//! concurrently with each other, recursively. The correlator runs in the
//! same scope until every group is done and nothing is outstanding.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use tracing::{info, warn};

use apiconform_core::{ResultEntry, ResultNode};

use crate::context::RunContext;
use crate::correlate::Correlator;
use crate::error::{GroupError, RunError};
use crate::group::{GroupContext, GroupState, TestGroup};
use crate::transport::Transport;

/// Group path for async results registered outside any group.
const ASYNC_GROUP: &str = "async";

#[derive(Debug, Default)]
pub struct Scheduler {
    groups: Vec<TestGroup>,
}

impl Scheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, group: TestGroup) -> Self {
        self.groups.push(group);
        self
    }

    pub fn add(&mut self, group: TestGroup) {
        self.groups.push(group);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Run every group and the correlator; returns the merged results tree.
    ///
    /// # Errors
    ///
    /// Returns the first fatal error once every started group has joined,
    /// or a dependency error before anything runs.
    pub fn run(&self, ctx: &RunContext) -> Result<ResultNode, RunError> {
        let forest = Forest::build(&self.groups)?;
        let transport = ctx.transport()?;
        let groups_done = AtomicBool::new(false);

        info!(groups = self.groups.len(), "run started");
        let (outcome, async_results) = thread::scope(|s| {
            let correlator = s.spawn(|| Correlator::new(ctx).run(&groups_done));
            let outcome = forest.run_many(ctx, transport.as_ref(), &forest.roots, None, &[]);
            groups_done.store(true, Ordering::Release);
            let async_results = correlator.join();
            (outcome, async_results)
        });
        let async_results =
            async_results.map_err(|_| RunError::Panicked("correlator".to_string()))?;

        if let Some(e) = outcome.fatal {
            return Err(e);
        }

        let mut tree = ResultNode::default();
        for (path, entries) in outcome.groups {
            tree.merge(ResultNode::at_path(&path, ResultNode::group(entries)));
        }
        for (mut path, entry) in async_results {
            if path.is_empty() {
                path.push(ASYNC_GROUP.to_string());
            }
            tree.merge(ResultNode::at_path(&path, ResultNode::group(vec![entry])));
        }
        info!("run finished");
        Ok(tree)
    }
}

#[derive(Debug, Default)]
struct Outcome {
    groups: Vec<(Vec<String>, Vec<ResultEntry>)>,
    fatal: Option<RunError>,
}

impl Outcome {
    fn absorb(&mut self, other: Self) {
        self.groups.extend(other.groups);
        if self.fatal.is_none() {
            self.fatal = other.fatal;
        }
    }
}

struct Forest<'g> {
    groups: &'g [TestGroup],
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

impl<'g> Forest<'g> {
    fn build(groups: &'g [TestGroup]) -> Result<Self, RunError> {
        let mut index = HashMap::new();
        for (i, g) in groups.iter().enumerate() {
            if index.insert(g.name.as_str(), i).is_some() {
                return Err(RunError::DuplicateGroup(g.name.clone()));
            }
        }

        let mut children = vec![Vec::new(); groups.len()];
        let mut roots = Vec::new();
        for (i, g) in groups.iter().enumerate() {
            match &g.depends_on {
                None => roots.push(i),
                Some(dep) => {
                    let parent = index.get(dep.as_str()).ok_or_else(|| {
                        RunError::UnknownDependency {
                            group: g.name.clone(),
                            dependency: dep.clone(),
                        }
                    })?;
                    children[*parent].push(i);
                }
            }
        }

        let forest = Self {
            groups,
            children,
            roots,
        };
        let mut reachable = vec![false; groups.len()];
        let mut stack = forest.roots.clone();
        while let Some(i) = stack.pop() {
            reachable[i] = true;
            stack.extend(&forest.children[i]);
        }
        let cyclic: Vec<&str> = groups
            .iter()
            .zip(&reachable)
            .filter(|(_, r)| !**r)
            .map(|(g, _)| g.name.as_str())
            .collect();
        if !cyclic.is_empty() {
            return Err(RunError::DependencyCycle(cyclic.join(", ")));
        }
        Ok(forest)
    }

    /// Planned expectations of every descendant of `i`.
    fn descendant_planned(&self, i: usize) -> usize {
        self.children[i]
            .iter()
            .map(|&c| self.groups[c].planned + self.descendant_planned(c))
            .sum()
    }

    fn run_many(
        &self,
        ctx: &RunContext,
        transport: &dyn Transport,
        indices: &[usize],
        parent: Option<&Arc<GroupState>>,
        path: &[String],
    ) -> Outcome {
        thread::scope(|s| {
            let handles: Vec<_> = indices
                .iter()
                .map(|&i| (i, s.spawn(move || self.run_one(ctx, transport, i, parent, path))))
                .collect();

            let mut outcome = Outcome::default();
            for (i, handle) in handles {
                match handle.join() {
                    Ok(o) => outcome.absorb(o),
                    Err(_) => outcome.absorb(Outcome {
                        groups: Vec::new(),
                        fatal: Some(RunError::Panicked(self.groups[i].name.clone())),
                    }),
                }
            }
            outcome
        })
    }

    fn run_one(
        &self,
        ctx: &RunContext,
        transport: &dyn Transport,
        i: usize,
        parent: Option<&Arc<GroupState>>,
        parent_path: &[String],
    ) -> Outcome {
        let group = &self.groups[i];
        let mut path = parent_path.to_vec();
        path.push(group.name.clone());
        let label = path.join(" > ");
        let state = parent.map_or_else(GroupState::root, GroupState::child);

        info!(group = %label, "group started");
        let mut cx = GroupContext::new(ctx, transport, path.clone(), Arc::clone(&state));
        let result = group.run(&mut cx);
        let mut entries = cx.into_entries();

        let mut outcome = Outcome::default();
        match result {
            Ok(()) => {
                info!(group = %label, results = entries.len(), "group finished");
                outcome.groups.push((path.clone(), entries));
                let children = self.run_many(ctx, transport, &self.children[i], Some(&state), &path);
                outcome.absorb(children);
            }
            Err(GroupError::Setup(failure)) => {
                let skipped = failure.skipped + self.descendant_planned(i);
                warn!(group = %label, message = %failure.message, skipped, "setup failed");
                entries.push(ResultEntry::setup_failure(
                    "setup",
                    failure.message,
                    skipped,
                    failure.partial,
                    failure.exchange,
                ));
                outcome.groups.push((path, entries));
            }
            Err(GroupError::Fatal(e)) => {
                warn!(group = %label, error = %e, "group aborted");
                outcome.groups.push((path, entries));
                outcome.fatal = Some(e);
            }
        }
        outcome
    }
}
