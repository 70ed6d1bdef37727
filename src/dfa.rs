//! Subset construction, minimization, and the compiled [`Machine`].
//!
//! DFA state ids are integers assigned by BFS from the start set, with
//! the start state fixed at 1.  Edges carry a byte set, a precondition
//! map and an ordered action list; edges that differ only in labels are
//! merged by label union.
//!
//! Determinism is validated during construction:
//!
//! - Two guard groups on the same byte group must be identical or
//!   mutually exclusive; a single unguarded group may additionally act
//!   as a fallback and is ordered after every guarded edge.
//! - Action lists of simultaneously enabled edges merge by stamp order,
//!   and the merge must preserve each edge's own sequence.
//! - A state whose members disagree on the EOF action list is an error.

use std::collections::{HashMap, VecDeque};
use std::io::Write;

use indexmap::{IndexMap, IndexSet};

use crate::byteset::ByteSet;
use crate::nfa::{ActionList, Nfa, PrecondMap};
use crate::re::Polarity;
use crate::CompileError;

// ---------------------------------------------------------------------------
// DFA representation
// ---------------------------------------------------------------------------

/// A deterministic transition.  `target` is a 1-based state id.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DfaEdge {
    pub labels: ByteSet,
    pub preconds: PrecondMap,
    pub actions: ActionList,
    pub target: u32,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct DfaState {
    /// Outgoing edges, guarded edges first, then by descending label
    /// count.  The interpreter and the goto generator both test edges
    /// in this order.
    pub edges: Vec<DfaEdge>,
    pub accept: bool,
    /// Actions to run when input ends in this state.
    pub eof_actions: ActionList,
}

/// A DFA with states numbered `1..=N`; state 1 is the start.
#[derive(Debug, Default)]
pub(crate) struct Dfa {
    states: Vec<DfaState>,
}

impl Dfa {
    pub fn state(&self, id: u32) -> &DfaState {
        &self.states[(id - 1) as usize]
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &DfaState)> {
        self.states
            .iter()
            .enumerate()
            .map(|(i, s)| ((i + 1) as u32, s))
    }
}

// ---------------------------------------------------------------------------
// Subset construction
// ---------------------------------------------------------------------------

/// Determinize an epsilon-free NFA.
pub(crate) fn determinize(nfa: &Nfa) -> Result<Dfa, CompileError> {
    let mut sets: IndexSet<Vec<usize>> = IndexSet::new();
    sets.insert(vec![nfa.start]);
    let mut states: Vec<DfaState> = Vec::new();

    let mut done = 0;
    while done < sets.len() {
        let set = sets.get_index(done).expect("worklist entry").clone();
        done += 1;

        // Partition the alphabet: bytes enabling the same set of NFA
        // edges form one group.
        let mut groups: IndexMap<Vec<(usize, usize)>, ByteSet> = IndexMap::new();
        for b in 0..=255u8 {
            let mut key = Vec::new();
            for &n in &set {
                for (ei, e) in nfa.nodes[n].edges.iter().enumerate() {
                    if e.labels.contains(b) {
                        key.push((n, ei));
                    }
                }
            }
            if key.is_empty() {
                continue;
            }
            let entry = groups.entry(key).or_insert(ByteSet::EMPTY);
            *entry = entry.union(&ByteSet::byte(b));
        }

        let mut edges: Vec<DfaEdge> = Vec::new();
        for (key, labels) in groups {
            // Split the enabled edges by guard; distinct guards must be
            // mutually exclusive, except for one unguarded fallback.
            let mut by_guard: IndexMap<&PrecondMap, Vec<(usize, usize)>> = IndexMap::new();
            for &(n, ei) in &key {
                by_guard
                    .entry(&nfa.nodes[n].edges[ei].preconds)
                    .or_default()
                    .push((n, ei));
            }
            let guards: Vec<&PrecondMap> = by_guard.keys().copied().collect();
            for i in 0..guards.len() {
                for j in i + 1..guards.len() {
                    let (g1, g2) = (guards[i], guards[j]);
                    if !g1.is_empty() && !g2.is_empty() && !mutually_exclusive(g1, g2) {
                        return Err(CompileError::Ambiguous(format!(
                            "transitions guarded by {:?} and {:?} can be enabled \
                             simultaneously on the same byte",
                            g1, g2
                        )));
                    }
                }
            }

            for (guard, members) in by_guard {
                let guard = guard.clone();
                let mut targets: Vec<usize> = members
                    .iter()
                    .map(|&(n, ei)| nfa.nodes[n].edges[ei].target)
                    .collect();
                targets.sort_unstable();
                targets.dedup();
                let actions = merge_action_lists(
                    members
                        .iter()
                        .map(|&(n, ei)| &nfa.nodes[n].edges[ei].actions),
                )?;
                let (tid, _) = sets.insert_full(targets);
                edges.push(DfaEdge {
                    labels,
                    preconds: guard,
                    actions,
                    target: (tid + 1) as u32,
                });
            }
        }

        // Merge edges identical up to their labels.
        let mut merged: Vec<DfaEdge> = Vec::new();
        for e in edges {
            match merged.iter_mut().find(|m| {
                m.target == e.target && m.preconds == e.preconds && m.actions == e.actions
            }) {
                Some(m) => m.labels = m.labels.union(&e.labels),
                None => merged.push(e),
            }
        }
        sort_edges(&mut merged);

        // Accept status and EOF actions: all member accept paths must
        // agree on a single action list.
        let mut eof_lists: Vec<&ActionList> = Vec::new();
        for &n in &set {
            for path in &nfa.nodes[n].accepts {
                if !eof_lists.iter().any(|l| **l == path.actions) {
                    eof_lists.push(&path.actions);
                }
            }
        }
        if eof_lists.len() > 1 {
            return Err(CompileError::Ambiguous(
                "more than one EOF action list reachable from an accept state".to_string(),
            ));
        }
        let accept = !eof_lists.is_empty();
        states.push(DfaState {
            edges: merged,
            accept,
            eof_actions: eof_lists.pop().cloned().unwrap_or_default(),
        });
    }

    Ok(Dfa { states })
}

/// Two guard maps are mutually exclusive when some name is pinned to
/// opposite polarities.
fn mutually_exclusive(g1: &PrecondMap, g2: &PrecondMap) -> bool {
    g1.iter().any(|(name, &p1)| {
        matches!(
            (p1, g2.get(name)),
            (Polarity::True, Some(Polarity::False)) | (Polarity::False, Some(Polarity::True))
        )
    })
}

/// Merge the action lists of simultaneously enabled edges.
///
/// Equal lists merge trivially.  Otherwise the deduplicated union is
/// ordered by stamp, and every input list must read as a subsequence of
/// the result — if one does not, the regex admits two different action
/// sequences for the same input.
fn merge_action_lists<'a>(
    lists: impl Iterator<Item = &'a ActionList>,
) -> Result<ActionList, CompileError> {
    let lists: Vec<&ActionList> = lists.collect();
    if lists.windows(2).all(|w| w[0] == w[1]) {
        return Ok(lists[0].clone());
    }
    let mut union: ActionList = Vec::new();
    for list in &lists {
        for action in *list {
            if !union.iter().any(|a| a.order == action.order) {
                union.push(action.clone());
            }
        }
    }
    union.sort_by_key(|a| a.order);
    for list in &lists {
        let mut cursor = 0;
        let ordered = list.iter().all(|action| {
            match union[cursor..].iter().position(|a| a.order == action.order) {
                Some(offset) => {
                    cursor += offset + 1;
                    true
                }
                None => false,
            }
        });
        if !ordered {
            return Err(CompileError::Ambiguous(
                "simultaneously enabled transitions carry conflicting action orders".to_string(),
            ));
        }
    }
    Ok(union)
}

/// Canonical edge order: guarded edges first (the goto generator's
/// if-else chain tests them before the unguarded fallback), then larger
/// label sets first, then by smallest byte.
fn sort_edges(edges: &mut [DfaEdge]) {
    edges.sort_by(|a, b| {
        a.preconds
            .is_empty()
            .cmp(&b.preconds.is_empty())
            .then_with(|| b.labels.len().cmp(&a.labels.len()))
            .then_with(|| a.labels.min().cmp(&b.labels.min()))
    });
}

// ---------------------------------------------------------------------------
// Minimization
// ---------------------------------------------------------------------------

/// Moore-style partition refinement under action/guard equivalence,
/// followed by BFS renumbering from the start state's class.
pub(crate) fn minimize(dfa: &Dfa) -> Dfa {
    let n = dfa.states.len();
    if n == 0 {
        return Dfa::default();
    }

    // Intern (guard, actions) pairs so byte signatures are cheap to
    // compare and hash.
    let mut labels: IndexSet<(PrecondMap, ActionList)> = IndexSet::new();
    let mut edge_label: Vec<Vec<usize>> = Vec::with_capacity(n);
    for state in &dfa.states {
        edge_label.push(
            state
                .edges
                .iter()
                .map(|e| {
                    labels
                        .insert_full((e.preconds.clone(), e.actions.clone()))
                        .0
                })
                .collect(),
        );
    }

    let mut class = vec![0usize; n];
    loop {
        let mut table: IndexMap<(bool, &ActionList, Vec<Vec<(usize, usize)>>), usize> =
            IndexMap::new();
        let mut next = vec![0usize; n];
        for (i, state) in dfa.states.iter().enumerate() {
            // Per-byte signature: the ordered (label-id, target-class)
            // pairs of the edges enabled on that byte.
            let mut bytes: Vec<Vec<(usize, usize)>> = vec![Vec::new(); 256];
            for (ei, e) in state.edges.iter().enumerate() {
                for (lo, hi) in e.labels.iter_ranges() {
                    for b in lo..=hi {
                        bytes[b as usize]
                            .push((edge_label[i][ei], class[(e.target - 1) as usize]));
                    }
                }
            }
            let key = (state.accept, &state.eof_actions, bytes);
            let id = table.len();
            let id = *table.entry(key).or_insert(id);
            next[i] = id;
        }
        if next == class {
            break;
        }
        class = next;
    }

    // Rebuild: BFS over classes from the start state's class.
    let representative: HashMap<usize, usize> = {
        let mut rep = HashMap::new();
        for (i, &c) in class.iter().enumerate() {
            rep.entry(c).or_insert(i);
        }
        rep
    };
    let mut new_id: HashMap<usize, u32> = HashMap::new();
    let mut order: Vec<usize> = Vec::new();
    let mut queue = VecDeque::from([class[0]]);
    new_id.insert(class[0], 1);
    while let Some(c) = queue.pop_front() {
        order.push(c);
        let rep = representative[&c];
        for e in &dfa.states[rep].edges {
            let tc = class[(e.target - 1) as usize];
            if !new_id.contains_key(&tc) {
                new_id.insert(tc, (new_id.len() + 1) as u32);
                queue.push_back(tc);
            }
        }
    }

    let mut states = Vec::with_capacity(order.len());
    for &c in &order {
        let rep = &dfa.states[representative[&c]];
        let mut edges: Vec<DfaEdge> = Vec::new();
        for e in &rep.edges {
            let target = new_id[&class[(e.target - 1) as usize]];
            match edges.iter_mut().find(|m| {
                m.target == target && m.preconds == e.preconds && m.actions == e.actions
            }) {
                Some(m) => m.labels = m.labels.union(&e.labels),
                None => edges.push(DfaEdge {
                    labels: e.labels,
                    preconds: e.preconds.clone(),
                    actions: e.actions.clone(),
                    target,
                }),
            }
        }
        sort_edges(&mut edges);
        states.push(DfaState {
            edges,
            accept: rep.accept,
            eof_actions: rep.eof_actions.clone(),
        });
    }
    Dfa { states }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// A fully compiled scanner: the minimized DFA plus the set of action
/// names it references.
#[derive(Debug)]
pub struct Machine {
    pub(crate) dfa: Dfa,
    pub(crate) action_names: Vec<String>,
}

/// The result of running a [`Machine`] over a byte buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scan {
    /// The names of the actions fired, in execution order, including
    /// EOF actions on a successful run.
    pub trace: Vec<String>,
    /// `None` on a full match; `Some(0)` when input ended in a
    /// non-accept state; `Some(k)` when byte `k` (1-based) had no
    /// transition.
    pub error: Option<usize>,
}

impl Machine {
    pub(crate) fn new(dfa: Dfa) -> Machine {
        let mut names: IndexSet<String> = IndexSet::new();
        for (_, state) in dfa.iter() {
            for e in &state.edges {
                for a in &e.actions {
                    names.insert(a.name.clone());
                }
            }
            for a in &state.eof_actions {
                names.insert(a.name.clone());
            }
        }
        Machine {
            dfa,
            action_names: names.into_iter().collect(),
        }
    }

    /// Number of DFA states; ids are `1..=state_count()`.
    pub fn state_count(&self) -> usize {
        self.dfa.len()
    }

    /// Names of all actions this machine can fire, in first-use order.
    pub fn action_names(&self) -> &[String] {
        &self.action_names
    }

    /// True when the machine carries any precondition guard (such a
    /// machine cannot go through the table generator).
    pub fn has_preconds(&self) -> bool {
        self.dfa
            .iter()
            .any(|(_, s)| s.edges.iter().any(|e| !e.preconds.is_empty()))
    }

    /// Whole-input language membership (preconditions all true).
    pub fn accepts(&self, data: &[u8]) -> bool {
        self.validate(data).is_none()
    }

    /// The target state for `(state, byte)` with every precondition
    /// true, or `None` when no transition matches.
    pub fn transition(&self, state: u32, byte: u8) -> Option<u32> {
        self.dfa
            .state(state)
            .edges
            .iter()
            .find(|e| e.labels.contains(byte) && guard_holds(&e.preconds, &|_| true))
            .map(|e| e.target)
    }

    /// Run the machine as a validator: `None` on a full match, `Some(0)`
    /// on unexpected EOF, `Some(k)` with the 1-based position of the
    /// first invalid byte otherwise.
    pub fn validate(&self, data: &[u8]) -> Option<usize> {
        self.scan(data, |_| true).error
    }

    /// Run the machine, recording the action trace.  `preconds` supplies
    /// the value of each named guard at transition time.
    pub fn scan(&self, data: &[u8], preconds: impl Fn(&str) -> bool) -> Scan {
        let mut trace = Vec::new();
        let mut cs: u32 = 1;
        for (i, &b) in data.iter().enumerate() {
            let state = self.dfa.state(cs);
            let edge = state
                .edges
                .iter()
                .find(|e| e.labels.contains(b) && guard_holds(&e.preconds, &preconds));
            match edge {
                Some(e) => {
                    trace.extend(e.actions.iter().map(|a| a.name.clone()));
                    cs = e.target;
                }
                None => {
                    return Scan {
                        trace,
                        error: Some(i + 1),
                    }
                }
            }
        }
        let state = self.dfa.state(cs);
        if state.accept {
            trace.extend(state.eof_actions.iter().map(|a| a.name.clone()));
            Scan { trace, error: None }
        } else {
            Scan {
                trace,
                error: Some(0),
            }
        }
    }

    /// Emit a Graphviz DOT rendering of the DFA.
    pub fn to_dot(&self, mut buffer: impl Write) {
        writeln!(buffer, "digraph machine {{").unwrap();
        writeln!(buffer, "\trankdir=LR;").unwrap();
        writeln!(buffer, "\t1 [shape=box];").unwrap();
        for (id, state) in self.dfa.iter() {
            if state.accept {
                writeln!(buffer, "\t{} [peripheries=2];", id).unwrap();
            }
            for e in &state.edges {
                writeln!(
                    buffer,
                    "\t{} -> {} [label=\"{}\"];",
                    id,
                    e.target,
                    edge_label(e)
                )
                .unwrap();
            }
        }
        writeln!(buffer, "}}").unwrap();
    }
}

fn guard_holds(preconds: &PrecondMap, eval: &impl Fn(&str) -> bool) -> bool {
    preconds.iter().all(|(name, polarity)| match polarity {
        Polarity::Both => true,
        Polarity::True => eval(name),
        Polarity::False => !eval(name),
    })
}

fn edge_label(e: &DfaEdge) -> String {
    let mut label = String::new();
    for (i, (lo, hi)) in e.labels.iter_ranges().enumerate() {
        if i > 0 {
            label.push(',');
        }
        if lo == hi {
            label.push_str(&printable(lo));
        } else {
            label.push_str(&format!("{}-{}", printable(lo), printable(hi)));
        }
    }
    for (name, polarity) in &e.preconds {
        match polarity {
            Polarity::Both => {}
            Polarity::True => label.push_str(&format!(" &{}", name)),
            Polarity::False => label.push_str(&format!(" &!{}", name)),
        }
    }
    if !e.actions.is_empty() {
        label.push_str(" / ");
        let names: Vec<&str> = e.actions.iter().map(|a| a.name.as_str()).collect();
        label.push_str(&names.join(","));
    }
    label
}

fn printable(b: u8) -> String {
    if b.is_ascii_graphic() {
        (b as char).to_string()
    } else {
        format!("{:#04x}", b)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
