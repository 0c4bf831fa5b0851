use color_eyre::Report;
use kirin::*;

// The counter-loop dialect: constants, addition, a fused compare-and-
// branch, an unconditional branch, a pause statement, and return.
#[derive(Debug, Clone, PartialEq)]
enum LoopLang {
    ConstI64(i64),
    Add,
    // Operands (x, bound); jumps to successor 0 with x when x < bound,
    // successor 1 with x otherwise.
    BranchLt,
    Branch,
    Pause,
    Return,
}

impl std::fmt::Display for LoopLang {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LoopLang::ConstI64(v) => write!(f, "{{ {} }}", v),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
struct I64Ty;

impl Dialect for LoopLang {
    type Type = I64Ty;

    fn namespace(&self) -> &'static str {
        "loop"
    }

    fn name(&self) -> &'static str {
        match self {
            LoopLang::ConstI64(_) => "const",
            LoopLang::Add => "add",
            LoopLang::BranchLt => "blt",
            LoopLang::Branch => "br",
            LoopLang::Pause => "pause",
            LoopLang::Return => "ret",
        }
    }

    fn is_pure(&self) -> bool {
        matches!(self, LoopLang::ConstI64(_) | LoopLang::Add)
    }

    fn is_speculatable(&self) -> bool {
        matches!(self, LoopLang::ConstI64(_) | LoopLang::Add)
    }

    fn is_constant(&self) -> bool {
        matches!(self, LoopLang::ConstI64(_))
    }

    fn is_terminator(&self) -> bool {
        matches!(self, LoopLang::BranchLt | LoopLang::Branch | LoopLang::Return)
    }
}

stages! {
    stage Main = "main";
}

type Stages = HCons<StageCell<Main, LoopLang>, HNil>;

// `Pause` suspends once, then lets execution proceed; the count lives in
// the session's global state.
trait PauseCount {
    fn should_pause(&mut self) -> bool;
}

impl PauseCount for () {
    fn should_pause(&mut self) -> bool {
        false
    }
}

impl PauseCount for usize {
    fn should_pause(&mut self) -> bool {
        let first = *self == 0;
        *self += 1;
        first
    }
}

impl<'p, G: PauseCount> Interpretable<StackInterpreter<'p, Stages, i64, G>> for LoopLang {
    fn interpret(
        &self,
        stmt: &StmtContext<'_>,
        interp: &mut StackInterpreter<'p, Stages, i64, G>,
    ) -> Result<Continuation<i64>, InterpreterError> {
        match self {
            LoopLang::ConstI64(v) => {
                interp.write(stmt.results[0], *v)?;
                Ok(Continuation::Continue)
            }
            LoopLang::Add => {
                let a = interp.read(stmt.operands[0])?;
                let b = interp.read(stmt.operands[1])?;
                interp.write(stmt.results[0], a + b)?;
                Ok(Continuation::Continue)
            }
            LoopLang::BranchLt => {
                let x = interp.read(stmt.operands[0])?;
                let bound = interp.read(stmt.operands[1])?;
                let target = if x < bound {
                    stmt.successors[0]
                } else {
                    stmt.successors[1]
                };
                Ok(Continuation::Jump(target, vec![x]))
            }
            LoopLang::Branch => {
                let args = stmt
                    .operands
                    .iter()
                    .map(|v| interp.read(*v))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Continuation::Jump(stmt.successors[0], args))
            }
            LoopLang::Pause => {
                if interp.get_global_mut().should_pause() {
                    Ok(Continuation::Break)
                } else {
                    Ok(Continuation::Continue)
                }
            }
            LoopLang::Return => Ok(Continuation::Return(interp.read(stmt.operands[0])?)),
        }
    }
}

struct Counter {
    spec: SpecFuncId,
    header: BlockId,
    blt: StmtId,
    x: Var,
}

// entry:        zero = const 0; br header(zero)
// header(x):    hundred = const 100; blt x, hundred -> [body(x), exit(x)]
// body(y):      one = const 1; t = add y, one; br header(t)
// exit(z):      ret z
fn build_counter(p: &mut Pipeline<Stages>) -> Result<Counter, Report> {
    p.staged_function::<Main, _>("counter", Signature::new(vec![], I64Ty))?;
    let (region, header, blt, x) = {
        let info = p.get_stage_mut::<Main, _>();
        let mut b = FunctionBuilder::new(info);
        let entry = b.append_block()?;
        let header = b.append_block()?;
        let body = b.append_block()?;
        let exit = b.append_block()?;
        b.set_cursor(header);
        let x = b.push_arg(I64Ty)?;
        b.set_cursor(body);
        let y = b.push_arg(I64Ty)?;
        b.set_cursor(exit);
        let z = b.push_arg(I64Ty)?;

        b.set_cursor(entry);
        let zero_s = b.push(LoopLang::ConstI64(0), vec![], vec![I64Ty], vec![])?;
        let zero = b.result_of(zero_s, 0)?;
        b.push(LoopLang::Branch, vec![zero], vec![], vec![header])?;

        b.set_cursor(header);
        let hundred_s = b.push(LoopLang::ConstI64(100), vec![], vec![I64Ty], vec![])?;
        let hundred = b.result_of(hundred_s, 0)?;
        let blt = b.push(LoopLang::BranchLt, vec![x, hundred], vec![], vec![body, exit])?;

        b.set_cursor(body);
        let one_s = b.push(LoopLang::ConstI64(1), vec![], vec![I64Ty], vec![])?;
        let one = b.result_of(one_s, 0)?;
        let t_s = b.push(LoopLang::Add, vec![y, one], vec![I64Ty], vec![])?;
        let t = b.result_of(t_s, 0)?;
        b.push(LoopLang::Branch, vec![t], vec![], vec![header])?;

        b.set_cursor(exit);
        b.push(LoopLang::Return, vec![z], vec![], vec![])?;
        (b.finish(), header, blt, x)
    };
    p.get_stage::<Main, _>().verify_region(region)?;
    let spec = p.specialize::<Main, _, _>(
        "counter",
        Signature::new(vec![], I64Ty),
        region,
        &ExactSemantics,
    )?;
    Ok(Counter {
        spec,
        header,
        blt,
        x,
    })
}

#[test]
fn counter_loop_runs_to_one_hundred() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = Pipeline::builder().stage::<Main, LoopLang>().finish();
    let counter = build_counter(&mut p)?;

    let mut interp: StackInterpreter<'_, Stages, i64> =
        StackInterpreter::new(&p, p.get_stage_id::<Main, _>()).with_fuel(10_000);
    let out = interp.call(counter.spec, vec![])?;
    assert_eq!(out, 100);
    // Step accounting is deterministic: entry takes 2 steps, each of the
    // 100 loop iterations 5, the final header visit 2, the exit 1.
    assert_eq!(interp.get_fuel(), Some(10_000 - 505));
    Ok(())
}

#[test]
fn fuel_exhaustion_leaves_cursor_on_the_branch() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = Pipeline::builder().stage::<Main, LoopLang>().finish();
    let counter = build_counter(&mut p)?;

    // 48 steps land exactly before the branch of the tenth header visit.
    let mut interp: StackInterpreter<'_, Stages, i64> =
        StackInterpreter::new(&p, p.get_stage_id::<Main, _>()).with_fuel(48);
    let err = interp.call(counter.spec, vec![]).unwrap_err();
    assert_eq!(err, InterpreterError::Exhausted);
    let stage = p.get_stage_id::<Main, _>();
    assert_eq!(interp.cursor(), Some((stage, counter.blt)));
    // The session state is still inspectable at the failing statement.
    let frame = interp.current_frame().expect("frame is intact");
    assert_eq!(frame.get(counter.x), Some(&9));
    Ok(())
}

#[test]
fn breakpoints_pause_and_resume() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = Pipeline::builder().stage::<Main, LoopLang>().finish();
    let counter = build_counter(&mut p)?;
    let stage = p.get_stage_id::<Main, _>();

    let mut interp: StackInterpreter<'_, Stages, i64> = StackInterpreter::new(&p, stage);
    interp.add_breakpoint(stage, counter.blt);
    interp.enter(counter.spec, vec![])?;

    let paused = interp.run_until_break()?;
    assert_eq!(paused, Paused::Breakpoint(counter.blt));
    assert_eq!(
        interp.current_frame().and_then(|f| f.get(counter.x)),
        Some(&0)
    );

    // Resuming does not re-trigger the same pause; the next stop is the
    // following loop iteration.
    let paused = interp.run_until_break()?;
    assert_eq!(paused, Paused::Breakpoint(counter.blt));
    assert_eq!(
        interp.current_frame().and_then(|f| f.get(counter.x)),
        Some(&1)
    );

    interp.remove_breakpoint(stage, counter.blt);
    let paused = interp.run_until_break()?;
    assert_eq!(paused, Paused::Finished(100));

    // `run` ignores the breakpoint set entirely.
    let mut free: StackInterpreter<'_, Stages, i64> = StackInterpreter::new(&p, stage);
    free.add_breakpoint(stage, counter.blt);
    assert_eq!(free.call(counter.spec, vec![])?, 100);

    let _ = counter.header;
    Ok(())
}

#[test]
fn dialect_break_suspends_without_advancing() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = Pipeline::builder().stage::<Main, LoopLang>().finish();
    p.staged_function::<Main, _>("pausing", Signature::new(vec![], I64Ty))?;
    let (region, pause) = {
        let info = p.get_stage_mut::<Main, _>();
        let mut b = FunctionBuilder::new(info);
        b.append_block()?;
        let pause = b.push(LoopLang::Pause, vec![], vec![], vec![])?;
        let c = b.push(LoopLang::ConstI64(7), vec![], vec![I64Ty], vec![])?;
        let v = b.result_of(c, 0)?;
        b.push(LoopLang::Return, vec![v], vec![], vec![])?;
        (b.finish(), pause)
    };
    let spec = p.specialize::<Main, _, _>(
        "pausing",
        Signature::new(vec![], I64Ty),
        region,
        &ExactSemantics,
    )?;

    diagnostics_color_disable();
    let dump = format!("{}", p.get_stage::<Main, _>().display_region(region));
    assert!(dump.contains("loop.const"));
    assert!(dump.contains("loop.ret"));

    let mut interp = StackInterpreter::<'_, Stages, i64>::new(&p, p.get_stage_id::<Main, _>())
        .with_global(0usize);
    interp.enter(spec, vec![])?;
    let paused = interp.run_until_break()?;
    assert_eq!(paused, Paused::Break(pause));
    // The cursor did not advance past the pausing statement.
    assert_eq!(interp.cursor().map(|(_, s)| s), Some(pause));
    let paused = interp.run_until_break()?;
    assert_eq!(paused, Paused::Finished(7));
    assert_eq!(*interp.get_global(), 2);
    Ok(())
}

#[test]
fn unbound_reads_are_recoverable() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = Pipeline::builder().stage::<Main, LoopLang>().finish();
    p.staged_function::<Main, _>("needs_repair", Signature::new(vec![], I64Ty))?;
    let (region, orphan) = {
        let info = p.get_stage_mut::<Main, _>();
        let mut b = FunctionBuilder::new(info);
        let entry = b.append_block()?;
        let stray = b.append_block()?;
        b.set_cursor(stray);
        // An argument of an unreachable block: defined, never bound.
        let orphan = b.push_arg(I64Ty)?;
        b.push(LoopLang::Return, vec![orphan], vec![], vec![])?;
        b.set_cursor(entry);
        b.push(LoopLang::Return, vec![orphan], vec![], vec![])?;
        (b.finish(), orphan)
    };
    let spec = p.specialize::<Main, _, _>(
        "needs_repair",
        Signature::new(vec![], I64Ty),
        region,
        &ExactSemantics,
    )?;

    let mut interp: StackInterpreter<'_, Stages, i64> =
        StackInterpreter::new(&p, p.get_stage_id::<Main, _>());
    interp.enter(spec, vec![])?;
    let err = interp.step().unwrap_err();
    assert_eq!(err, InterpreterError::Unbound(orphan));
    // Repair the binding in place and retry from the same cursor.
    interp
        .current_frame_mut()
        .expect("frame is intact")
        .bind(orphan, 41);
    let control = interp.step()?;
    assert_eq!(interp.advance(control)?, Progress::Finished(41));
    Ok(())
}

#[test]
fn max_depth_is_enforced_on_entry() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = Pipeline::builder().stage::<Main, LoopLang>().finish();
    let counter = build_counter(&mut p)?;
    let mut interp: StackInterpreter<'_, Stages, i64> =
        StackInterpreter::new(&p, p.get_stage_id::<Main, _>()).with_max_depth(0);
    let err = interp.enter(counter.spec, vec![]).unwrap_err();
    assert_eq!(err, InterpreterError::MaxDepthExceeded);
    Ok(())
}
