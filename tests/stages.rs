use color_eyre::Report;
use kirin::*;

// A dialect whose call statement resolves its callee specialization at
// interpretation time, against whatever stage the target lives on.
#[derive(Debug, Clone)]
enum ChainLang {
    ConstI64(i64),
    Sub,
    Invoke { target: CallTarget },
    // Operands (x, bound); successor 0 taken when x <= bound.
    BranchLe,
    Return,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
struct IntTy;

impl Dialect for ChainLang {
    type Type = IntTy;

    fn namespace(&self) -> &'static str {
        "chain"
    }

    fn name(&self) -> &'static str {
        match self {
            ChainLang::ConstI64(_) => "const",
            ChainLang::Sub => "sub",
            ChainLang::Invoke { .. } => "invoke",
            ChainLang::BranchLe => "ble",
            ChainLang::Return => "ret",
        }
    }

    fn is_pure(&self) -> bool {
        matches!(self, ChainLang::ConstI64(_) | ChainLang::Sub)
    }

    fn is_constant(&self) -> bool {
        matches!(self, ChainLang::ConstI64(_))
    }

    fn is_terminator(&self) -> bool {
        matches!(self, ChainLang::BranchLe | ChainLang::Return)
    }

    fn call_target(&self) -> Option<CallTarget> {
        match self {
            ChainLang::Invoke { target } => Some(*target),
            _ => None,
        }
    }
}

stages! {
    stage A = "a";
    stage B = "b";
    stage C = "c";
}

type Stages = HCons<
    StageCell<C, ChainLang>,
    HCons<StageCell<B, ChainLang>, HCons<StageCell<A, ChainLang>, HNil>>,
>;
type Machine<'p> = StackInterpreter<'p, Stages, i64>;

impl<'p> Interpretable<Machine<'p>> for ChainLang {
    fn interpret(
        &self,
        stmt: &StmtContext<'_>,
        interp: &mut Machine<'p>,
    ) -> Result<Continuation<i64>, InterpreterError> {
        match self {
            ChainLang::ConstI64(v) => {
                interp.write(stmt.results[0], *v)?;
                Ok(Continuation::Continue)
            }
            ChainLang::Sub => {
                let a = interp.read(stmt.operands[0])?;
                let b = interp.read(stmt.operands[1])?;
                interp.write(stmt.results[0], a - b)?;
                Ok(Continuation::Continue)
            }
            ChainLang::Invoke { target } => {
                let args = stmt
                    .operands
                    .iter()
                    .map(|v| interp.read(*v))
                    .collect::<Result<Vec<_>, _>>()?;
                // Resolve the callee in its own stage's storage, through
                // the runtime stage view.
                let info = interp
                    .get_pipeline()
                    .get_stage_dyn(target.stage)
                    .ok_or(InterpreterError::BadState)?
                    .downcast_ref::<StageInfo<ChainLang>>()
                    .ok_or(InterpreterError::BadState)?;
                let call_sig = Signature::new(vec![IntTy; args.len()], IntTy);
                let (callee, _env) = info
                    .resolve(target.staged, &call_sig, &ExactSemantics)
                    .map_err(InterpreterError::CallResolutionFailed)?;
                Ok(Continuation::Call {
                    callee,
                    stage: target.stage,
                    args,
                    result: stmt.results[0],
                })
            }
            ChainLang::BranchLe => {
                let x = interp.read(stmt.operands[0])?;
                let bound = interp.read(stmt.operands[1])?;
                let target = if x <= bound {
                    stmt.successors[0]
                } else {
                    stmt.successors[1]
                };
                Ok(Continuation::Jump(target, vec![x]))
            }
            ChainLang::Return => Ok(Continuation::Return(interp.read(stmt.operands[0])?)),
        }
    }
}

// f@A(n): if n <= 0 return 0 else return g(n - 1)
// g@C(n): return h(n)
// h@B(n): return f(n)
fn build_chain(p: &mut Pipeline<Stages>) -> Result<SpecFuncId, Report> {
    let sig = Signature::new(vec![IntTy], IntTy);
    let f_staged = p.staged_function::<A, _>("f", sig.clone())?;
    let g_staged = p.staged_function::<C, _>("g", sig.clone())?;
    let h_staged = p.staged_function::<B, _>("h", sig.clone())?;
    let g_target = CallTarget {
        stage: p.get_stage_id::<C, _>(),
        staged: g_staged,
        specialized: None,
    };
    let h_target = CallTarget {
        stage: p.get_stage_id::<B, _>(),
        staged: h_staged,
        specialized: None,
    };
    let f_target = CallTarget {
        stage: p.get_stage_id::<A, _>(),
        staged: f_staged,
        specialized: None,
    };

    // f at stage A.
    let f_region = {
        let info = p.get_stage_mut::<A, _>();
        let mut b = FunctionBuilder::new(info);
        let entry = b.append_block()?;
        let base = b.append_block()?;
        let recurse = b.append_block()?;
        b.set_cursor(entry);
        let n = b.push_arg(IntTy)?;
        b.set_cursor(base);
        let n_base = b.push_arg(IntTy)?;
        b.set_cursor(recurse);
        let n_rec = b.push_arg(IntTy)?;

        b.set_cursor(entry);
        let zero_s = b.push(ChainLang::ConstI64(0), vec![], vec![IntTy], vec![])?;
        let zero = b.result_of(zero_s, 0)?;
        b.push(ChainLang::BranchLe, vec![n, zero], vec![], vec![base, recurse])?;

        b.set_cursor(base);
        let out_s = b.push(ChainLang::ConstI64(0), vec![], vec![IntTy], vec![])?;
        let out = b.result_of(out_s, 0)?;
        b.push(ChainLang::Return, vec![out], vec![], vec![])?;
        let _ = n_base;

        b.set_cursor(recurse);
        let one_s = b.push(ChainLang::ConstI64(1), vec![], vec![IntTy], vec![])?;
        let one = b.result_of(one_s, 0)?;
        let m_s = b.push(ChainLang::Sub, vec![n_rec, one], vec![IntTy], vec![])?;
        let m = b.result_of(m_s, 0)?;
        let call_s = b.push(
            ChainLang::Invoke { target: g_target },
            vec![m],
            vec![IntTy],
            vec![],
        )?;
        let r = b.result_of(call_s, 0)?;
        b.push(ChainLang::Return, vec![r], vec![], vec![])?;
        b.finish()
    };

    // g at stage C and h at stage B are plain trampolines.
    let g_region = {
        let info = p.get_stage_mut::<C, _>();
        let mut b = FunctionBuilder::new(info);
        b.append_block()?;
        let n = b.push_arg(IntTy)?;
        let call_s = b.push(
            ChainLang::Invoke { target: h_target },
            vec![n],
            vec![IntTy],
            vec![],
        )?;
        let r = b.result_of(call_s, 0)?;
        b.push(ChainLang::Return, vec![r], vec![], vec![])?;
        b.finish()
    };
    let h_region = {
        let info = p.get_stage_mut::<B, _>();
        let mut b = FunctionBuilder::new(info);
        b.append_block()?;
        let n = b.push_arg(IntTy)?;
        let call_s = b.push(
            ChainLang::Invoke { target: f_target },
            vec![n],
            vec![IntTy],
            vec![],
        )?;
        let r = b.result_of(call_s, 0)?;
        b.push(ChainLang::Return, vec![r], vec![], vec![])?;
        b.finish()
    };

    let f_spec = p.specialize::<A, _, _>("f", sig.clone(), f_region, &ExactSemantics)?;
    p.specialize::<C, _, _>("g", sig.clone(), g_region, &ExactSemantics)?;
    p.specialize::<B, _, _>("h", sig, h_region, &ExactSemantics)?;
    Ok(f_spec)
}

fn pipeline() -> Pipeline<Stages> {
    let mut p = Pipeline::builder()
        .stage::<A, ChainLang>()
        .stage::<B, ChainLang>()
        .stage::<C, ChainLang>()
        .finish();
    let a = p.get_stage_id::<A, _>();
    let b = p.get_stage_id::<B, _>();
    let c = p.get_stage_id::<C, _>();
    p.add_lowering_edge(a, c);
    p.add_lowering_edge(c, b);
    p
}

#[test]
fn mixed_stage_recursion_completes_dynamically() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = pipeline();
    let f_spec = build_chain(&mut p)?;

    let mut interp: Machine<'_> =
        StackInterpreter::new(&p, p.get_stage_id::<A, _>()).with_fuel(10_000);
    let out = interp.call(f_spec, vec![3])?;
    assert_eq!(out, 0);
    // Every frame of the chain ran on its own stage and the stack fully
    // unwound.
    assert!(interp.get_frames().is_empty());

    diagnostics_color_disable();
    let summary = format!("{}", p);
    assert!(summary.contains("pipeline (3 stages)"));
    assert!(summary.contains("lowers to"));
    Ok(())
}

#[test]
fn frames_carry_their_stage_through_the_chain() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = pipeline();
    let f_spec = build_chain(&mut p)?;
    let a = p.get_stage_id::<A, _>();
    let c = p.get_stage_id::<C, _>();

    let mut interp: Machine<'_> = StackInterpreter::new(&p, a);
    interp.enter(f_spec, vec![2])?;
    // Step until the first call pushes a frame on stage C.
    loop {
        let control = interp.step()?;
        interp.advance(control)?;
        if interp.get_frames().len() == 2 {
            break;
        }
    }
    let stages = interp
        .get_frames()
        .iter()
        .map(|f| f.get_stage())
        .collect::<Vec<_>>();
    assert_eq!(stages, vec![a, c]);
    Ok(())
}

#[test]
fn typed_driver_rejects_the_first_cross_stage_transition() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = pipeline();
    let f_spec = build_chain(&mut p)?;
    let a = p.get_stage_id::<A, _>();
    let c = p.get_stage_id::<C, _>();

    let mut interp: Machine<'_> = StackInterpreter::new(&p, a);
    interp.enter(f_spec, vec![3])?;
    let err = interp.run_on::<A, _>().unwrap_err();
    assert_eq!(
        err,
        InterpreterError::StageMismatch {
            expected: Some(a),
            found: c
        }
    );
    // The dynamic driver picks up the very same session and finishes it.
    let out = interp.run()?;
    assert_eq!(out, Some(0));
    Ok(())
}

#[test]
fn depth_limit_cuts_the_recursion() -> Result<(), Report> {
    diagnostics_setup()?;
    let mut p = pipeline();
    let f_spec = build_chain(&mut p)?;

    // f(3) needs ten frames; five are not enough.
    let mut interp: Machine<'_> =
        StackInterpreter::new(&p, p.get_stage_id::<A, _>()).with_max_depth(5);
    let err = interp.call(f_spec, vec![3]).unwrap_err();
    assert_eq!(err, InterpreterError::MaxDepthExceeded);
    Ok(())
}
