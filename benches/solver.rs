//! Benchmarks for the dataflow solver and the pass pipeline.
//!
//! Scope trees are synthesized as chains of loop nests so that the worklist has to
//! revisit blocks before reaching a fixed point:
//! - Liveness on a single large scope
//! - Store placement on a scope with a captured local
//! - The full default pipeline, with and without unboxing

extern crate scopeflow;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scopeflow::{
    analysis::{DataFlowSolver, LiveVariables, StorePlacement},
    compiler::{CompilerConfig, PassScheduler},
    ir::{CallInstr, EdgeKind, Instr, Operand, ScopeId, ScopeTree},
    Result,
};
use std::hint::black_box;

/// Builds a method with `loops` sequential counting loops over shared locals, each loop
/// body passing a closure that captures the accumulator.
fn loop_chain(loops: usize) -> Result<(ScopeTree, ScopeId)> {
    let mut tree = ScopeTree::new();
    let m = tree.add_method("bench");
    let blk = tree.add_closure(m, "blk")?;
    let i = tree.local(m, "i", 0)?;
    let acc = tree.local(m, "acc", 0)?;
    let inner = tree.local(blk, "acc", 1)?;
    let cond = tree.new_temporary(m);

    let cfg = tree.cfg_mut(m)?;
    let init = cfg.add_block("init");
    cfg.add_edge(cfg.entry(), init, EdgeKind::FallThrough);
    cfg.push(init, Instr::copy(acc, Operand::Float(0.0)));
    cfg.push(init, Instr::copy(i, Operand::Fixnum(0)));

    let mut previous = init;
    for n in 0..loops {
        let head = cfg.add_block(&format!("head{n}"));
        let body = cfg.add_block(&format!("body{n}"));
        let done = cfg.add_block(&format!("done{n}"));
        cfg.add_edge(previous, head, EdgeKind::FallThrough);
        cfg.add_edge(head, body, EdgeKind::FallThrough);
        cfg.add_edge(head, done, EdgeKind::Regular);
        cfg.add_edge(body, head, EdgeKind::Regular);

        cfg.push(done, Instr::copy(i, Operand::Fixnum(0)));
        cfg.push(head, Instr::call(Some(cond), i, "<", vec![Operand::Fixnum(100)]));
        cfg.push(head, Instr::BranchFalse { arg: cond.into(), target: done });
        cfg.push(body, Instr::call(Some(acc), acc, "+", vec![Operand::Float(1.5)]));
        cfg.push(
            body,
            Instr::Call(CallInstr::new(None, Operand::Nil, "each", vec![]).with_closure(Operand::Closure(blk))),
        );
        cfg.push(body, Instr::call(Some(i), i, "+", vec![Operand::Fixnum(1)]));
        cfg.push(body, Instr::Jump { target: head });
        previous = done;
    }
    let exit = cfg.exit();
    cfg.push(previous, Instr::Return { value: acc.into() });
    cfg.add_edge(previous, exit, EdgeKind::Exit);

    let ccfg = tree.cfg_mut(blk)?;
    let c1 = ccfg.add_block("c1");
    ccfg.add_edge(ccfg.entry(), c1, EdgeKind::FallThrough);
    let cexit = ccfg.exit();
    ccfg.add_edge(c1, cexit, EdgeKind::Exit);
    ccfg.push(c1, Instr::call(None, Operand::Nil, "p", vec![inner.into()]));
    Ok((tree, m))
}

fn bench_liveness(c: &mut Criterion) {
    let mut group = c.benchmark_group("liveness");
    for loops in [4, 32, 128] {
        let (tree, m) = loop_chain(loops).expect("bench tree builds");
        let blocks = tree.cfg(m).map(|cfg| cfg.block_count()).unwrap_or_default();
        group.throughput(Throughput::Elements(blocks as u64));
        group.bench_with_input(BenchmarkId::from_parameter(loops), &tree, |b, tree| {
            b.iter(|| {
                let problem = LiveVariables::new(tree, m, []).unwrap();
                black_box(DataFlowSolver::new(problem).solve(tree).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_store_placement(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_placement");
    for loops in [4, 32, 128] {
        let (tree, m) = loop_chain(loops).expect("bench tree builds");
        group.bench_with_input(BenchmarkId::from_parameter(loops), &tree, |b, tree| {
            b.iter(|| {
                let problem = StorePlacement::new(tree, m, []).unwrap();
                black_box(DataFlowSolver::new(problem).solve(tree).unwrap())
            });
        });
    }
    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let default = PassScheduler::default();
    let unboxing = PassScheduler::new(CompilerConfig::default().with_unboxing(true));

    let mut group = c.benchmark_group("pipeline");
    for loops in [4, 32] {
        group.bench_with_input(BenchmarkId::new("default", loops), &loops, |b, &loops| {
            b.iter_batched(
                || loop_chain(loops).unwrap(),
                |(mut tree, m)| black_box(default.run(&mut tree, m).unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
        group.bench_with_input(BenchmarkId::new("unboxing", loops), &loops, |b, &loops| {
            b.iter_batched(
                || loop_chain(loops).unwrap(),
                |(mut tree, m)| black_box(unboxing.run(&mut tree, m).unwrap()),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_liveness, bench_store_placement, bench_pipeline);
criterion_main!(benches);
