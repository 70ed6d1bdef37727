//! NFA construction from the desugared regex algebra.
//!
//! The builder runs a Thompson-style construction over a flat node
//! arena.  Epsilon edges exist only during construction: boundary
//! actions (`enter`/`exit`) and guards ride on them, and a final
//! elimination pass folds every epsilon path into the concrete byte
//! edge it leads to.  The resulting [`Nfa`] has only byte-labelled
//! edges, each carrying an ordered action list and a precondition map,
//! plus per-node accept paths holding the actions to run when input
//! ends there.
//!
//! Action instances are stamped with an `order` value as the annotated
//! tree is walked.  `all` actions draw from a low band so they sort
//! before boundary actions wherever lists from parallel edges are
//! merged; boundary actions are stamped pre-order for `enter` and
//! post-order for `final`/`exit`, which yields the inside-out exit and
//! outside-in enter ordering downstream.
//!
//! `isec` and `diff` are not NFA-composable directly: both operands are
//! determinized, combined by product construction, and the product is
//! lifted back into the arena as an ordinary fragment.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::byteset::ByteSet;
use crate::dfa;
use crate::re::{Node, Polarity, Regex};
use crate::CompileError;

/// Conjunction of named guards required to traverse an edge.
pub(crate) type PrecondMap = BTreeMap<String, Polarity>;

/// One action occurrence.  `order` identifies the occurrence uniquely
/// and fixes its position when lists from parallel edges are merged.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct Action {
    pub name: String,
    pub order: u32,
}

pub(crate) type ActionList = Vec<Action>;

/// Boundary (`enter`/`exit`/`final`) stamps start here; `all` stamps
/// start at zero so they sort first.
const BOUNDARY_BASE: u32 = 1 << 20;

/// Conjoin `name@polarity` into `map`.  Returns `false` when the
/// conjunction became unsatisfiable (the name is constrained both ways).
pub(crate) fn conjoin(map: &mut PrecondMap, name: &str, polarity: Polarity) -> bool {
    match polarity {
        Polarity::Both => {
            map.entry(name.to_string()).or_insert(Polarity::Both);
            true
        }
        p => match map.get(name) {
            Some(&q) if q != Polarity::Both && q != p => false,
            _ => {
                map.insert(name.to_string(), p);
                true
            }
        },
    }
}

fn conjoin_map(dst: &mut PrecondMap, src: &PrecondMap) -> bool {
    for (name, &polarity) in src {
        if !conjoin(dst, name, polarity) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Eliminated NFA
// ---------------------------------------------------------------------------

/// A byte-labelled transition.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct NfaEdge {
    pub labels: ByteSet,
    pub actions: ActionList,
    pub preconds: PrecondMap,
    pub target: usize,
}

/// One way a node can complete the whole regex without consuming more
/// input: the actions are the exit chains on the epsilon path to the
/// accept node.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct AcceptPath {
    pub actions: ActionList,
    pub preconds: PrecondMap,
}

#[derive(Debug, Default)]
pub(crate) struct NfaNode {
    pub edges: Vec<NfaEdge>,
    pub accepts: Vec<AcceptPath>,
}

/// An epsilon-free NFA over the byte alphabet.
#[derive(Debug)]
pub(crate) struct Nfa {
    pub nodes: Vec<NfaNode>,
    pub start: usize,
}

impl Nfa {
    /// Build an [`Nfa`] from a desugared, annotated regex.
    pub fn from_regex(re: &Regex) -> Result<Nfa, CompileError> {
        let mut builder = Builder::default();
        let frag = builder.build(re)?;
        builder.eliminate(frag)
    }
}

// ---------------------------------------------------------------------------
// Builder (with epsilon edges)
// ---------------------------------------------------------------------------

/// A fragment under construction, with a unique entry and accept node.
#[derive(Clone, Copy, Debug)]
struct Frag {
    start: usize,
    accept: usize,
}

#[derive(Debug)]
struct EpsEdge {
    source: usize,
    target: usize,
    actions: ActionList,
    preconds: PrecondMap,
}

#[derive(Debug)]
struct ByteEdge {
    source: usize,
    target: usize,
    labels: ByteSet,
    /// `all`-band actions; rendered before any boundary actions that a
    /// folded epsilon path contributes.
    pre_actions: ActionList,
    /// `final` actions and lifted product lists; rendered after the
    /// folded path.
    post_actions: ActionList,
    preconds: PrecondMap,
}

#[derive(Debug, Default)]
struct Builder {
    node_count: usize,
    eps: Vec<EpsEdge>,
    bytes: Vec<ByteEdge>,
    boundary_order: u32,
    all_order: u32,
}

impl Builder {
    fn node(&mut self) -> usize {
        let id = self.node_count;
        self.node_count += 1;
        id
    }

    fn eps_plain(&mut self, source: usize, target: usize) {
        self.eps.push(EpsEdge {
            source,
            target,
            actions: Vec::new(),
            preconds: PrecondMap::new(),
        });
    }

    fn stamp_boundary(&mut self, names: &[String]) -> ActionList {
        names
            .iter()
            .map(|name| {
                let order = BOUNDARY_BASE + self.boundary_order;
                self.boundary_order += 1;
                Action {
                    name: name.clone(),
                    order,
                }
            })
            .collect()
    }

    fn stamp_all(&mut self, names: &[String]) -> ActionList {
        names
            .iter()
            .map(|name| {
                let order = self.all_order;
                self.all_order += 1;
                Action {
                    name: name.clone(),
                    order,
                }
            })
            .collect()
    }

    /// Build the fragment for `re`, decorating it with the node's
    /// annotations.  `enter` actions are stamped before the children
    /// are built, `final`/`exit` after, so stamp order follows the
    /// temporal order of events along any single pass through the tree.
    fn build(&mut self, re: &Regex) -> Result<Frag, CompileError> {
        let eps_mark = self.eps.len();
        let byte_mark = self.bytes.len();

        let enter_actions = self.stamp_boundary(&re.actions.enter);
        let core = self.build_core(re.node())?;
        let fin_actions = self.stamp_boundary(&re.actions.fin);
        let exit_actions = self.stamp_boundary(&re.actions.exit);
        let all_actions = self.stamp_all(&re.actions.all);

        // `all` actions and the `all` guard decorate every byte edge of
        // the fragment, entry transitions included.
        if !all_actions.is_empty() || re.precond_all.is_some() {
            for i in byte_mark..self.bytes.len() {
                self.bytes[i].pre_actions.extend(all_actions.iter().cloned());
                if let Some((name, polarity)) = &re.precond_all {
                    if !conjoin(&mut self.bytes[i].preconds, name, *polarity) {
                        // Contradictory guard: the edge can never fire.
                        self.bytes[i].labels = ByteSet::EMPTY;
                    }
                }
            }
        }

        // `final` actions decorate the byte edges from which the
        // fragment can complete without consuming further bytes.
        if !fin_actions.is_empty() {
            let finals = self.final_byte_edges(byte_mark, eps_mark, core.accept);
            if finals.is_empty() {
                return Err(CompileError::FinalOnIndefinite);
            }
            for i in finals {
                self.bytes[i].post_actions.extend(fin_actions.iter().cloned());
            }
        }

        // Entry boundary: a dedicated epsilon carrying enter actions
        // and the enter/all guards, so every transition into the
        // fragment picks them up.
        let needs_entry = !enter_actions.is_empty()
            || re.precond_enter.is_some()
            || re.precond_all.is_some();
        let start = if needs_entry {
            let s = self.node();
            let mut preconds = PrecondMap::new();
            let mut satisfiable = true;
            if let Some((name, polarity)) = &re.precond_enter {
                satisfiable &= conjoin(&mut preconds, name, *polarity);
            }
            if let Some((name, polarity)) = &re.precond_all {
                satisfiable &= conjoin(&mut preconds, name, *polarity);
            }
            if satisfiable {
                self.eps.push(EpsEdge {
                    source: s,
                    target: core.start,
                    actions: enter_actions,
                    preconds,
                });
            }
            s
        } else {
            core.start
        };

        // Exit boundary: transitions leaving the fragment run the exit
        // actions; the same epsilon feeds the EOF accept paths.
        let accept = if !exit_actions.is_empty() {
            let f = self.node();
            self.eps.push(EpsEdge {
                source: core.accept,
                target: f,
                actions: exit_actions,
                preconds: PrecondMap::new(),
            });
            f
        } else {
            core.accept
        };

        Ok(Frag { start, accept })
    }

    fn build_core(&mut self, node: &Node) -> Result<Frag, CompileError> {
        match node {
            Node::Set(set) => {
                let start = self.node();
                let accept = self.node();
                if !set.is_empty() {
                    self.bytes.push(ByteEdge {
                        source: start,
                        target: accept,
                        labels: *set,
                        pre_actions: Vec::new(),
                        post_actions: Vec::new(),
                        preconds: PrecondMap::new(),
                    });
                }
                Ok(Frag { start, accept })
            }
            Node::Cat(xs) => {
                if xs.is_empty() {
                    let n = self.node();
                    return Ok(Frag {
                        start: n,
                        accept: n,
                    });
                }
                let first = self.build(&xs[0])?;
                let mut accept = first.accept;
                for x in &xs[1..] {
                    let frag = self.build(x)?;
                    self.eps_plain(accept, frag.start);
                    accept = frag.accept;
                }
                Ok(Frag {
                    start: first.start,
                    accept,
                })
            }
            Node::Alt(xs) => {
                let start = self.node();
                let accept = self.node();
                for x in xs {
                    let frag = self.build(x)?;
                    self.eps_plain(start, frag.start);
                    self.eps_plain(frag.accept, accept);
                }
                Ok(Frag { start, accept })
            }
            Node::Rep(x) => {
                let start = self.node();
                let accept = self.node();
                let frag = self.build(x)?;
                self.eps_plain(start, accept);
                self.eps_plain(start, frag.start);
                self.eps_plain(frag.accept, frag.start);
                self.eps_plain(frag.accept, accept);
                Ok(Frag { start, accept })
            }
            Node::Isec(a, b) => self.product(a, b, ProductKind::Isec),
            Node::Diff(a, b) => self.product(a, b, ProductKind::Diff),
            other => unreachable!("sugar node {:?} survived desugaring", other),
        }
    }

    /// Indices of byte edges created since `byte_mark` whose target can
    /// reach `accept` through epsilon edges created since `eps_mark`
    /// (i.e. edges lying within the fragment under construction).
    fn final_byte_edges(&self, byte_mark: usize, eps_mark: usize, accept: usize) -> Vec<usize> {
        let mut adj: HashMap<usize, Vec<usize>> = HashMap::new();
        for e in &self.eps[eps_mark..] {
            adj.entry(e.source).or_default().push(e.target);
        }
        let reaches_accept = |from: usize| -> bool {
            if from == accept {
                return true;
            }
            let mut seen = HashSet::new();
            let mut queue = VecDeque::from([from]);
            seen.insert(from);
            while let Some(n) = queue.pop_front() {
                for &t in adj.get(&n).into_iter().flatten() {
                    if t == accept {
                        return true;
                    }
                    if seen.insert(t) {
                        queue.push_back(t);
                    }
                }
            }
            false
        };
        (byte_mark..self.bytes.len())
            .filter(|&i| reaches_accept(self.bytes[i].target))
            .collect()
    }

    // -- Product construction for isec/diff ----------------------------------

    /// Build an operand as a standalone NFA, sharing the stamp counters
    /// so action orders stay globally unique.
    fn subnfa(&mut self, re: &Regex) -> Result<Nfa, CompileError> {
        let mut sub = Builder {
            boundary_order: self.boundary_order,
            all_order: self.all_order,
            ..Builder::default()
        };
        let frag = sub.build(re)?;
        let nfa = sub.eliminate(frag)?;
        self.boundary_order = sub.boundary_order;
        self.all_order = sub.all_order;
        Ok(nfa)
    }

    fn product(&mut self, a: &Regex, b: &Regex, kind: ProductKind) -> Result<Frag, CompileError> {
        if has_preconds(a) || has_preconds(b) {
            return Err(CompileError::PrecondInFilter);
        }
        if has_actions(b) {
            return Err(CompileError::ActionInFilter);
        }

        let da = dfa::determinize(&self.subnfa(a)?)?;
        let db = dfa::determinize(&self.subnfa(b)?)?;

        // Product state (ia, ib): `ib == 0` is the dead b-side used by
        // difference once the filter has failed.
        let mut pairs: HashMap<(u32, u32), usize> = HashMap::new();
        let mut queue: VecDeque<(u32, u32)> = VecDeque::new();
        let start_pair = (1u32, 1u32);
        let start_node = self.node();
        pairs.insert(start_pair, start_node);
        queue.push_back(start_pair);

        let accept = self.node();

        while let Some((ia, ib)) = queue.pop_front() {
            let source = pairs[&(ia, ib)];
            let sa = da.state(ia);

            let mut push_edge = |builder: &mut Builder,
                                 pairs: &mut HashMap<(u32, u32), usize>,
                                 queue: &mut VecDeque<(u32, u32)>,
                                 labels: ByteSet,
                                 actions: &ActionList,
                                 pair: (u32, u32)| {
                let target = *pairs.entry(pair).or_insert_with(|| {
                    queue.push_back(pair);
                    builder.node()
                });
                builder.bytes.push(ByteEdge {
                    source,
                    target,
                    labels,
                    pre_actions: Vec::new(),
                    post_actions: actions.clone(),
                    preconds: PrecondMap::new(),
                });
            };

            for ea in &sa.edges {
                let mut residual = ea.labels;
                if ib != 0 {
                    for eb in &db.state(ib).edges {
                        let joint = ea.labels.intersect(&eb.labels);
                        if joint.is_empty() {
                            continue;
                        }
                        residual = residual.difference(&eb.labels);
                        push_edge(
                            self,
                            &mut pairs,
                            &mut queue,
                            joint,
                            &ea.actions,
                            (ea.target, eb.target),
                        );
                    }
                }
                // Bytes the filter cannot follow: intersection drops
                // them, difference keeps scanning with a dead b-side.
                if kind == ProductKind::Diff && !residual.is_empty() {
                    push_edge(
                        self,
                        &mut pairs,
                        &mut queue,
                        residual,
                        &ea.actions,
                        (ea.target, 0),
                    );
                }
            }

            let a_accept = sa.accept;
            let b_accept = ib != 0 && db.state(ib).accept;
            let accepts = match kind {
                ProductKind::Isec => a_accept && b_accept,
                ProductKind::Diff => a_accept && !b_accept,
            };
            if accepts {
                self.eps.push(EpsEdge {
                    source,
                    target: accept,
                    actions: sa.eof_actions.clone(),
                    preconds: PrecondMap::new(),
                });
            }
        }

        Ok(Frag {
            start: start_node,
            accept,
        })
    }

    // -- Epsilon elimination -------------------------------------------------

    /// Fold every epsilon path into the byte edge (or accept node) it
    /// leads to, producing the final epsilon-free [`Nfa`].
    fn eliminate(&self, frag: Frag) -> Result<Nfa, CompileError> {
        let mut eps_from: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, e) in self.eps.iter().enumerate() {
            eps_from.entry(e.source).or_default().push(i);
        }
        let mut bytes_from: HashMap<usize, Vec<usize>> = HashMap::new();
        for (i, e) in self.bytes.iter().enumerate() {
            if !e.labels.is_empty() {
                bytes_from.entry(e.source).or_default().push(i);
            }
        }

        // The nodes surviving elimination: the start plus every byte
        // edge target.
        let mut real: Vec<usize> = vec![frag.start];
        real.extend(self.bytes.iter().filter(|e| !e.labels.is_empty()).map(|e| e.target));
        real.sort_unstable();
        real.dedup();
        let index_of: HashMap<usize, usize> =
            real.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        let mut nodes: Vec<NfaNode> = (0..real.len()).map(|_| NfaNode::default()).collect();

        for (slot, &origin) in real.iter().enumerate() {
            let mut out_edges: Vec<NfaEdge> = Vec::new();
            let mut accepts: Vec<AcceptPath> = Vec::new();
            self.walk_eps(
                origin,
                Vec::new(),
                PrecondMap::new(),
                &mut vec![origin].into_iter().collect(),
                &eps_from,
                &bytes_from,
                frag.accept,
                &index_of,
                &mut out_edges,
                &mut accepts,
            );
            nodes[slot].edges = out_edges;
            nodes[slot].accepts = accepts;
        }

        let mut nfa = Nfa {
            nodes,
            start: index_of[&frag.start],
        };
        prune_unreachable(&mut nfa);
        Ok(nfa)
    }

    /// Depth-first enumeration of the simple epsilon paths out of a
    /// node, emitting one concrete edge per (path, byte edge) combo and
    /// one accept path per path reaching the fragment accept.
    #[allow(clippy::too_many_arguments)]
    fn walk_eps(
        &self,
        at: usize,
        path_actions: ActionList,
        path_preconds: PrecondMap,
        on_path: &mut HashSet<usize>,
        eps_from: &HashMap<usize, Vec<usize>>,
        bytes_from: &HashMap<usize, Vec<usize>>,
        accept: usize,
        index_of: &HashMap<usize, usize>,
        out_edges: &mut Vec<NfaEdge>,
        out_accepts: &mut Vec<AcceptPath>,
    ) {
        for &bi in bytes_from.get(&at).into_iter().flatten() {
            let be = &self.bytes[bi];
            let mut preconds = path_preconds.clone();
            if !conjoin_map(&mut preconds, &be.preconds) {
                continue;
            }
            let mut actions = be.pre_actions.clone();
            actions.extend(path_actions.iter().cloned());
            actions.extend(be.post_actions.iter().cloned());
            let edge = NfaEdge {
                labels: be.labels,
                actions,
                preconds,
                target: index_of[&be.target],
            };
            if !out_edges.contains(&edge) {
                out_edges.push(edge);
            }
        }
        if at == accept {
            let path = AcceptPath {
                actions: path_actions.clone(),
                preconds: path_preconds.clone(),
            };
            if !out_accepts.contains(&path) {
                out_accepts.push(path);
            }
        }
        for &ei in eps_from.get(&at).into_iter().flatten() {
            let ee = &self.eps[ei];
            if on_path.contains(&ee.target) {
                continue;
            }
            let mut preconds = path_preconds.clone();
            if !conjoin_map(&mut preconds, &ee.preconds) {
                continue;
            }
            let mut actions = path_actions.clone();
            actions.extend(ee.actions.iter().cloned());
            on_path.insert(ee.target);
            self.walk_eps(
                ee.target,
                actions,
                preconds,
                on_path,
                eps_from,
                bytes_from,
                accept,
                index_of,
                out_edges,
                out_accepts,
            );
            on_path.remove(&ee.target);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProductKind {
    Isec,
    Diff,
}

fn has_actions(re: &Regex) -> bool {
    !re.actions.is_empty() || children(re).iter().any(|c| has_actions(c))
}

fn has_preconds(re: &Regex) -> bool {
    re.precond_enter.is_some()
        || re.precond_all.is_some()
        || children(re).iter().any(|c| has_preconds(c))
}

fn children(re: &Regex) -> Vec<&Regex> {
    match re.node() {
        Node::Cat(xs) | Node::Alt(xs) => xs.iter().collect(),
        Node::Rep(x) | Node::Rep1(x) | Node::Opt(x) | Node::Neg(x) => vec![x],
        Node::Isec(a, b) | Node::Diff(a, b) => vec![a, b],
        _ => Vec::new(),
    }
}

/// Drop nodes unreachable from the start, renumbering the rest.
fn prune_unreachable(nfa: &mut Nfa) {
    let mut reachable = vec![false; nfa.nodes.len()];
    let mut queue = VecDeque::from([nfa.start]);
    reachable[nfa.start] = true;
    while let Some(n) = queue.pop_front() {
        for e in &nfa.nodes[n].edges {
            if !reachable[e.target] {
                reachable[e.target] = true;
                queue.push_back(e.target);
            }
        }
    }
    if reachable.iter().all(|&r| r) {
        return;
    }
    let mut remap = vec![usize::MAX; nfa.nodes.len()];
    let mut kept = 0;
    for (i, &r) in reachable.iter().enumerate() {
        if r {
            remap[i] = kept;
            kept += 1;
        }
    }
    let nodes = std::mem::take(&mut nfa.nodes);
    nfa.nodes = nodes
        .into_iter()
        .enumerate()
        .filter(|(i, _)| reachable[*i])
        .map(|(_, mut node)| {
            for e in &mut node.edges {
                e.target = remap[e.target];
            }
            node
        })
        .collect();
    nfa.start = remap[nfa.start];
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
