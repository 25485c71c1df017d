//! Dataflow integration tests.
//!
//! These tests drive the analyses through the public API only:
//! 1. Build a scope tree and its control flow graphs
//! 2. Solve a problem with `DataFlowSolver`
//! 3. Query the published solution, or let it rewrite the IR

use std::{cell::RefCell, collections::BTreeSet, rc::Rc};

use scopeflow::{
    analysis::{
        DataFlowSolver, DefinedVariables, LiveOutSets, LiveVariables, UnboxableOps, UnboxingCache,
        UnboxingReport,
    },
    ir::{AluOp, BlockId, CallInstr, Cfg, EdgeKind, Instr, Operand, ScopeId, ScopeTree, VarId},
    utils::BitSet,
    Error, Result,
};

/// Link `labels` as a straight line from entry to exit.
fn chain<const N: usize>(cfg: &mut Cfg, labels: [&str; N]) -> [BlockId; N] {
    let blocks = labels.map(|label| cfg.add_block(label));
    let mut previous = cfg.entry();
    for &block in &blocks {
        cfg.add_edge(previous, block, EdgeKind::FallThrough);
        previous = block;
    }
    let exit = cfg.exit();
    cfg.add_edge(previous, exit, EdgeKind::Exit);
    blocks
}

fn all_instructions(tree: &ScopeTree, scope: ScopeId) -> Result<Vec<Instr>> {
    let cfg = tree.cfg(scope)?;
    Ok(cfg
        .block_ids()
        .flat_map(|block| cfg.instructions(block).to_vec())
        .collect())
}

fn live_out_sets(tree: &ScopeTree, scopes: &[ScopeId]) -> Result<LiveOutSets> {
    let mut live = LiveOutSets::new();
    for &scope in scopes {
        let solution = DataFlowSolver::new(LiveVariables::new(tree, scope, [])?).solve(tree)?;
        live.insert(scope, &solution);
    }
    Ok(live)
}

fn unbox(tree: &mut ScopeTree, root: ScopeId) -> Result<UnboxingReport> {
    let scopes = tree.preorder(root)?;
    let live = live_out_sets(tree, &scopes)?;
    let mut cache = UnboxingCache::new();
    UnboxableOps::new(tree, root, &mut cache)?
        .solve(tree)?
        .unbox(tree, &live)
}

#[test]
fn test_liveness_across_two_blocks() -> Result<()> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("m");
    let x = tree.local(m, "x", 0)?;
    let y = tree.local(m, "y", 0)?;
    let [b1, b2] = chain(tree.cfg_mut(m)?, ["b1", "b2"]);
    let cfg = tree.cfg_mut(m)?;
    cfg.push(b1, Instr::copy(x, Operand::Fixnum(1)));
    cfg.push(b1, Instr::Jump { target: b2 });
    cfg.push(b2, Instr::call(Some(y), x, "+", vec![Operand::Fixnum(1)]));
    cfg.push(b2, Instr::Return { value: y.into() });

    let solution = DataFlowSolver::new(LiveVariables::new(&tree, m, [])?).solve(&tree)?;
    let only_x: BTreeSet<VarId> = [x].into_iter().collect();
    assert_eq!(solution.live_in(b2), Some(only_x.clone()));
    assert_eq!(solution.live_out(b1), Some(only_x));
    assert!(solution.vars_live_on_scope_entry(&tree)?.is_empty());
    assert!(solution.is_computed(b1));
    assert!(solution.is_computed(b2));
    Ok(())
}

#[test]
fn test_published_liveness_only_grows() -> Result<()> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("m");
    let i = tree.local(m, "i", 0)?;
    let acc = tree.local(m, "acc", 0)?;
    let c = tree.new_temporary(m);
    let [head, body, done] = chain(tree.cfg_mut(m)?, ["head", "body", "done"]);
    let cfg = tree.cfg_mut(m)?;
    cfg.push(head, Instr::call(Some(c), i, "<", vec![Operand::Fixnum(10)]));
    cfg.push(head, Instr::BranchFalse { arg: c.into(), target: done });
    cfg.push(body, Instr::call(Some(acc), acc, "+", vec![i.into()]));
    cfg.push(body, Instr::call(Some(i), i, "+", vec![Operand::Fixnum(1)]));
    cfg.push(body, Instr::Jump { target: head });
    cfg.add_edge(head, done, EdgeKind::Regular);
    cfg.add_edge(body, head, EdgeKind::Regular);
    cfg.push(done, Instr::Return { value: acc.into() });

    let history: Rc<RefCell<Vec<(BlockId, BitSet)>>> = Rc::default();
    let sink = Rc::clone(&history);
    let mut solution = DataFlowSolver::new(LiveVariables::new(&tree, m, [])?)
        .with_observer(move |block, state: &BitSet| sink.borrow_mut().push((block, state.clone())))
        .solve(&tree)?;

    let history = history.borrow();
    assert!(!history.is_empty());
    for block in tree.cfg(m)?.block_ids() {
        let states: Vec<&BitSet> = history
            .iter()
            .filter(|(b, _)| *b == block)
            .map(|(_, s)| s)
            .collect();
        for pair in states.windows(2) {
            assert!(pair[0].is_subset(pair[1]), "{block} shrank between visits");
        }
    }
    assert!(solution.is_live_in(head, acc));
    assert!(solution.is_live_in(head, i));
    assert!(solution.is_fixpoint(&tree)?);
    Ok(())
}

#[test]
fn test_visit_limit_is_reported() -> Result<()> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("m");
    let x = tree.local(m, "x", 0)?;
    let [head, body] = chain(tree.cfg_mut(m)?, ["head", "body"]);
    let cfg = tree.cfg_mut(m)?;
    cfg.add_edge(body, head, EdgeKind::Regular);
    cfg.push(head, Instr::call(None, x, "p", vec![]));
    cfg.push(body, Instr::copy(x, Operand::Nil));

    let result = DataFlowSolver::new(LiveVariables::new(&tree, m, [])?)
        .with_visit_limit(1)
        .solve(&tree);
    assert!(matches!(result, Err(Error::NonConvergence { .. })));
    Ok(())
}

#[test]
fn test_undefined_read_after_one_armed_assignment() -> Result<()> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("m");
    let c = tree.local(m, "c", 0)?;
    let x = tree.local(m, "x", 0)?;
    let [head, then, join] = chain(tree.cfg_mut(m)?, ["head", "then", "join"]);
    let cfg = tree.cfg_mut(m)?;
    cfg.push(head, Instr::ReceiveArg { dst: c, index: 0 });
    cfg.push(head, Instr::BranchFalse { arg: c.into(), target: join });
    cfg.add_edge(head, join, EdgeKind::Regular);
    cfg.push(then, Instr::copy(x, Operand::Fixnum(1)));
    cfg.push(join, Instr::Return { value: x.into() });

    let report = DataFlowSolver::new(DefinedVariables::new(m))
        .solve(&tree)?
        .identify_inits(&tree)?;
    assert_eq!(report.uses.len(), 1);
    assert_eq!(report.uses[0].block, join);
    assert_eq!(report.uses[0].var, x);
    assert!(report.vars.contains(&x));
    assert!(!report.vars.contains(&c));
    Ok(())
}

#[test]
fn test_float_sum_is_computed_unboxed() -> Result<()> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("m");
    let a = tree.local(m, "a", 0)?;
    let b = tree.local(m, "b", 0)?;
    let c = tree.local(m, "c", 0)?;
    let [b1] = chain(tree.cfg_mut(m)?, ["b1"]);
    let cfg = tree.cfg_mut(m)?;
    cfg.push(b1, Instr::copy(a, Operand::Float(1.5)));
    cfg.push(b1, Instr::copy(b, Operand::Float(2.5)));
    cfg.push(b1, Instr::call(Some(c), a, "+", vec![b.into()]));
    cfg.push(b1, Instr::Return { value: c.into() });

    let report = unbox(&mut tree, m)?;
    assert_eq!(report.operations, 1);

    let instrs = all_instructions(&tree, m)?;
    assert!(instrs
        .iter()
        .any(|i| matches!(i, Instr::Alu { op: AluOp::FAdd, .. })));
    assert!(!instrs.iter().any(|i| matches!(i, Instr::Call(_))));
    // The boxed result is rebuilt before it leaves the scope
    let ret = instrs
        .iter()
        .position(|i| matches!(i, Instr::Return { .. }))
        .expect("the return survives");
    assert!(instrs[..ret]
        .iter()
        .any(|i| matches!(i, Instr::Box { dst, .. } if *dst == c)));
    Ok(())
}

#[test]
fn test_unboxing_twice_changes_nothing() -> Result<()> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("m");
    let x = tree.local(m, "x", 0)?;
    let y = tree.local(m, "y", 0)?;
    let [b1, b2] = chain(tree.cfg_mut(m)?, ["b1", "b2"]);
    let cfg = tree.cfg_mut(m)?;
    cfg.push(b1, Instr::copy(x, Operand::Fixnum(3)));
    cfg.push(b2, Instr::call(Some(y), x, "<<", vec![Operand::Fixnum(2)]));
    cfg.push(b2, Instr::call(None, Operand::Nil, "p", vec![y.into()]));

    let first = unbox(&mut tree, m)?;
    assert!(!first.is_empty());
    let after_first = all_instructions(&tree, m)?;

    let second = unbox(&mut tree, m)?;
    assert!(second.is_empty(), "{second:?}");
    assert_eq!(all_instructions(&tree, m)?, after_first);
    Ok(())
}

#[test]
fn test_closure_is_unboxed_from_its_root() -> Result<()> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("m");
    let blk = tree.add_closure(m, "blk")?;
    let n = tree.local(blk, "n", 0)?;
    let r = tree.local(blk, "r", 0)?;
    let [b1] = chain(tree.cfg_mut(m)?, ["b1"]);
    tree.cfg_mut(m)?.push(
        b1,
        Instr::Call(CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(Operand::Closure(blk))),
    );
    let [c1] = chain(tree.cfg_mut(blk)?, ["c1"]);
    let ccfg = tree.cfg_mut(blk)?;
    ccfg.push(c1, Instr::copy(n, Operand::Fixnum(4)));
    ccfg.push(c1, Instr::call(Some(r), n, "*", vec![Operand::Fixnum(3)]));
    ccfg.push(c1, Instr::Return { value: r.into() });

    let report = unbox(&mut tree, m)?;
    assert_eq!(report.scopes, 2);
    assert!(all_instructions(&tree, blk)?
        .iter()
        .any(|i| matches!(i, Instr::Alu { op: AluOp::IMul, .. })));
    Ok(())
}
