//! Pretty-printing for the IR entities. The printed form is flat and
//! deterministic: block labels, SSA value names, operand lists, successor
//! lists, and dialect `namespace.name` tags with their payloads —
//! everything an external parser needs to reconstruct the structure.

use crate::core::dialect::Dialect;
use crate::core::ir::{RegionId, Var};
use crate::core::pipeline::{Pipeline, StageList, StorageCounts};
use crate::core::stage::StageInfo;
use std::fmt;
use yansi::Paint;
use {indenter::indented, std::fmt::Write};

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", Paint::white(format!("%{}", self.get_id())))
    }
}

impl fmt::Display for StorageCounts {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} values, {} statements, {} blocks, {} regions, {} staged, {} specialized",
            self.values, self.stmts, self.blocks, self.regions, self.staged, self.specialized
        )
    }
}

/// Renders one region of a stage, blocks in list order.
#[derive(Debug)]
pub struct RegionDisplay<'a, L: Dialect> {
    info: &'a StageInfo<L>,
    region: RegionId,
}

impl<L: Dialect> StageInfo<L> {
    pub fn display_region(&self, region: RegionId) -> RegionDisplay<'_, L> {
        RegionDisplay { info: self, region }
    }
}

impl<'a, L> fmt::Display for RegionDisplay<'a, L>
where
    L: Dialect + fmt::Display,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let region = match self.info.get_region(self.region) {
            Ok(r) => r,
            Err(_) => return write!(f, "<dead region>"),
        };
        let mut block = region.get_entry();
        while let Some(b) = block {
            let blk = match self.info.get_block(b) {
                Ok(blk) => blk,
                Err(_) => return write!(f, "<dead block>"),
            };
            write!(f, "{}", Paint::white(format!("^bb{}", b.get_id())).bold())?;
            let args = blk.get_args();
            if !args.is_empty() {
                write!(f, "(")?;
                let l = args.len();
                for (ind, arg) in args.iter().enumerate() {
                    let ty = self
                        .info
                        .get_value(*arg)
                        .map(|v| format!("{:?}", v.get_type()))
                        .unwrap_or_else(|_| "?".to_string());
                    match l - 1 == ind {
                        true => write!(f, "{} : {}", arg, Paint::magenta(ty))?,
                        _ => write!(f, "{} : {}, ", arg, Paint::magenta(ty))?,
                    };
                }
                write!(f, ")")?;
            }
            writeln!(f, ":")?;
            let mut stmt = blk.get_first();
            while let Some(s) = stmt {
                let st = match self.info.get_statement(s) {
                    Ok(st) => st,
                    Err(_) => return write!(f, "<dead statement>"),
                };
                let mut line = String::new();
                let results = st.get_results();
                if !results.is_empty() {
                    let l = results.len();
                    for (ind, r) in results.iter().enumerate() {
                        match l - 1 == ind {
                            true => write!(line, "{} = ", r)?,
                            _ => write!(line, "{}, ", r)?,
                        };
                    }
                }
                write!(
                    line,
                    "{}.{}",
                    Paint::green(st.def().namespace()).underline(),
                    Paint::green(st.def().name()).bold()
                )?;
                write!(line, " {}", st.def())?;
                if !st.get_operands().is_empty() {
                    write!(line, "(")?;
                    let l = st.get_operands().len();
                    for (ind, arg) in st.get_operands().iter().enumerate() {
                        match l - 1 == ind {
                            true => write!(line, "{}", arg)?,
                            _ => write!(line, "{}, ", arg)?,
                        };
                    }
                    write!(line, ")")?;
                }
                if !st.get_successors().is_empty() {
                    write!(line, " -> [")?;
                    let l = st.get_successors().len();
                    for (ind, succ) in st.get_successors().iter().enumerate() {
                        let label = Paint::white(format!("^bb{}", succ.get_id()));
                        match l - 1 == ind {
                            true => write!(line, "{}", label)?,
                            _ => write!(line, "{}, ", label)?,
                        };
                    }
                    write!(line, "]")?;
                }
                writeln!(indented(f).with_str("  "), "{}", line)?;
                for r in st.get_regions() {
                    writeln!(
                        indented(&mut indented(f).with_str("  ")).with_str("  "),
                        "{}",
                        self.info.display_region(*r)
                    )?;
                }
                stmt = st.get_next();
            }
            block = blk.get_next();
        }
        Ok(())
    }
}

impl<S: StageList> fmt::Display for Pipeline<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} ({} stages)",
            Paint::blue("pipeline").bold(),
            self.get_stages().count()
        )?;
        let mut lines = Vec::new();
        self.get_stages().for_each(&mut |store| {
            lines.push(format!(
                "{} {}: {}",
                store.stage(),
                Paint::blue(store.symbol().to_string()).bold(),
                store.counts()
            ));
        });
        // The list is built head-first; print in registration order.
        for line in lines.iter().rev() {
            writeln!(indented(f).with_str("  "), "{}", line)?;
        }
        for (from, to) in self.get_lowering_edges() {
            writeln!(indented(f).with_str("  "), "{} lowers to {}", from, to)?;
        }
        Ok(())
    }
}
