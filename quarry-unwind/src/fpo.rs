//! The postfix evaluator for frame-pointer-omission records.
//!
//! Functions compiled without a standard frame pointer carry a frame-data
//! record in the debug container: frame-size components plus a small
//! program, stored as an ASCII string, that computes the caller's
//! registers. Programs are postfix: whitespace-separated tokens over
//! named variables (`$…`), frame constants (`.…`), decimal literals, the
//! four arithmetic operators plus modulo, a dereference operator `^`
//! reading one machine word through the memory capability, and an
//! assignment operator `=` whose left operand must be a variable.
//!
//! The variable store is an order-preserving chained hash table; the
//! evaluator seeds it with the record's frame constants and the caller's
//! register values, runs the program, and reads the registers back.

use nom::bytes::complete::take_while1;
use nom::character::complete::multispace0;
use nom::combinator::all_consuming;
use nom::multi::many0;
use nom::sequence::{preceded, terminated};
use nom::Finish;

use quarry_common::HashTable;
use quarry_msf::{Msf, MsfError};

use crate::base::ProcessMemory;
use crate::{UnwindError, UnwindErrorKind};

/// One token of a postfix program.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Deref,
    Assign,
    Operand(String),
}

fn classify(word: &str) -> Token {
    match word {
        "+" => Token::Add,
        "-" => Token::Sub,
        "*" => Token::Mul,
        "/" => Token::Div,
        "%" => Token::Mod,
        "^" => Token::Deref,
        "=" => Token::Assign,
        other => Token::Operand(other.to_string()),
    }
}

/// Splits a program into whitespace-separated tokens.
fn tokenize(program: &str) -> Result<Vec<Token>, UnwindError> {
    let token = preceded(
        multispace0,
        take_while1(|c: char| !c.is_ascii_whitespace()),
    );
    let mut parser = all_consuming(terminated(many0(token), multispace0));
    let (_, words) = parser(program).finish().map_err(|e: nom::error::Error<&str>| {
        UnwindError::new(
            UnwindErrorKind::MalformedProgram,
            format!("parse: cannot tokenize near {:?}", e.input),
        )
    })?;
    Ok(words.into_iter().map(classify).collect())
}

/// An operand on the evaluation stack: a name or a computed value.
#[derive(Debug, Clone)]
enum Operand {
    Name(String),
    Value(u64),
}

/// The postfix stack machine.
pub struct Evaluator<'mem, M> {
    memory: Option<&'mem M>,
    word_size: usize,
    values: HashTable<u64>,
    stack: Vec<Operand>,
}

impl<'mem, M: ProcessMemory> Evaluator<'mem, M> {
    /// Creates an evaluator reading machine words of `word_size` bytes.
    pub fn new(word_size: usize) -> Self {
        Evaluator {
            memory: None,
            word_size,
            values: HashTable::with_buckets(8),
            stack: Vec::new(),
        }
    }

    /// Attaches the memory capability dereferences read through.
    pub fn memory(mut self, memory: &'mem M) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Sets a variable, creating it if needed.
    pub fn set(&mut self, name: &str, value: u64) {
        self.values.set(name, value);
    }

    /// The current value of a variable.
    pub fn get(&self, name: &str) -> Option<u64> {
        self.values.get(name).copied()
    }

    fn pop(&mut self) -> Result<Operand, UnwindError> {
        self.stack
            .pop()
            .ok_or_else(|| UnwindError::new(UnwindErrorKind::StackUnderflow, "pop: stack empty"))
    }

    /// The value of an operand: a named variable's stored value, or a
    /// decimal literal.
    fn value_of(&self, operand: &Operand) -> Result<u64, UnwindError> {
        match operand {
            Operand::Value(value) => Ok(*value),
            Operand::Name(name) if name.starts_with('$') || name.starts_with('.') => self
                .get(name)
                .ok_or_else(|| {
                    UnwindError::new(
                        UnwindErrorKind::UndefinedVariable,
                        format!("get_value: no value found ({name})"),
                    )
                }),
            Operand::Name(name) => match name.parse::<i64>() {
                Ok(value) => Ok(value as u64),
                Err(_) => Err(UnwindError::new(
                    UnwindErrorKind::InvalidOperand,
                    format!("get_value: not a literal ({name})"),
                )),
            },
        }
    }

    fn pop_value(&mut self) -> Result<u64, UnwindError> {
        let operand = self.pop()?;
        self.value_of(&operand)
    }

    fn binop(&mut self, token: &Token) -> Result<(), UnwindError> {
        let rhs = self.pop_value()?;
        let lhs = self.pop_value()?;
        if matches!(token, Token::Div | Token::Mod) && rhs == 0 {
            return Err(UnwindError::new(
                UnwindErrorKind::DivisionByZero,
                "binop: division by zero",
            ));
        }
        let result = match token {
            Token::Add => lhs.wrapping_add(rhs),
            Token::Sub => lhs.wrapping_sub(rhs),
            Token::Mul => lhs.wrapping_mul(rhs),
            Token::Div => lhs / rhs,
            Token::Mod => lhs % rhs,
            _ => unreachable!(),
        };
        self.stack.push(Operand::Value(result));
        Ok(())
    }

    fn deref(&mut self) -> Result<(), UnwindError> {
        let address = self.pop_value()?;
        let memory = self.memory.ok_or_else(|| {
            UnwindError::new(
                UnwindErrorKind::MemoryUnreadable,
                "deref: no memory available",
            )
        })?;
        let value = memory.read_word(address, self.word_size).map_err(|e| {
            UnwindError::with_source(
                UnwindErrorKind::MemoryUnreadable,
                format!("deref: cannot read mem at {address:#x}"),
                e,
            )
        })?;
        self.stack.push(Operand::Value(value));
        Ok(())
    }

    fn assign(&mut self) -> Result<(), UnwindError> {
        let value = self.pop_value()?;
        let target = self.pop()?;
        match target {
            Operand::Name(name) if name.starts_with('$') => {
                self.values.set(&name, value);
                Ok(())
            }
            Operand::Name(name) => Err(UnwindError::new(
                UnwindErrorKind::NotAVariable,
                format!("assign: {name} isn't a variable"),
            )),
            Operand::Value(value) => Err(UnwindError::new(
                UnwindErrorKind::NotAVariable,
                format!("assign: {value} isn't a variable"),
            )),
        }
    }

    /// Runs a program. Returns the value left on top of the stack, if
    /// the program leaves one (pure assignments leave none).
    pub fn process(&mut self, program: &str) -> Result<Option<u64>, UnwindError> {
        for token in tokenize(program)? {
            match token {
                Token::Operand(word) => self.stack.push(Operand::Name(word)),
                Token::Deref => self.deref()?,
                Token::Assign => self.assign()?,
                op => self.binop(&op)?,
            }
        }
        match self.stack.last() {
            Some(top) => Ok(Some(self.value_of(&top.clone())?)),
            None => Ok(None),
        }
    }
}

/// One extended frame-data record.
#[derive(Debug, Clone, Copy)]
pub struct FpoData {
    /// Image-relative start of the function.
    pub start: u32,
    pub size: u32,
    pub locals_size: u32,
    pub params_size: u32,
    pub max_stack_size: u32,
    /// Offset of the program string in the global string table.
    pub program: u32,
    pub prolog_size: u16,
    pub saved_regs_size: u16,
    pub flags: u32,
}

/// Unwinding through the container's extended frame-data stream.
pub struct FpoUnwinder<'m, 'data> {
    msf: &'m Msf<'data>,
    stream: u32,
    word_size: usize,
}

impl<'m, 'data> FpoUnwinder<'m, 'data> {
    /// Creates an unwinder over the frame-data stream with the given id
    /// (published by the debug-information header's auxiliary stream
    /// list).
    pub fn new(msf: &'m Msf<'data>, stream: u32, word_size: usize) -> Self {
        FpoUnwinder {
            msf,
            stream,
            word_size,
        }
    }

    /// Finds the frame-data record covering an image-relative address.
    pub fn find_record(&self, rva: u64) -> Result<Option<FpoData>, UnwindError> {
        let mut walker = self.msf.walker(self.stream).map_err(container)?;
        if walker.remaining() % 32 != 0 {
            return Err(UnwindError::new(
                UnwindErrorKind::BadUnwindData,
                "frame data stream size is not a multiple of the record size",
            ));
        }
        while walker.remaining() >= 32 {
            let record = FpoData {
                start: walker.read_u32().map_err(container)?,
                size: walker.read_u32().map_err(container)?,
                locals_size: walker.read_u32().map_err(container)?,
                params_size: walker.read_u32().map_err(container)?,
                max_stack_size: walker.read_u32().map_err(container)?,
                program: walker.read_u32().map_err(container)?,
                prolog_size: walker.read_u16().map_err(container)?,
                saved_regs_size: walker.read_u16().map_err(container)?,
                flags: walker.read_u32().map_err(container)?,
            };
            if record.start as u64 <= rva && rva < record.start as u64 + record.size as u64 {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// Unwinds one frame: locates the record covering `rva`, fetches its
    /// program, evaluates it with the caller's registers seeded, and
    /// writes changed registers back into `registers`.
    ///
    /// Returns `false` when no record covers the address, so the caller
    /// can fall back to another strategy. Evaluation failures carry a
    /// textual diagnosis and fail only this frame.
    pub fn unwind_frame<M: ProcessMemory>(
        &self,
        memory: &M,
        rva: u64,
        registers: &mut [(&str, u64)],
    ) -> Result<bool, UnwindError> {
        let Some(record) = self.find_record(rva)? else {
            return Ok(false);
        };
        let program = self
            .msf
            .string_table()
            .and_then(|strings| strings.get(record.program))
            .map_err(container)?;
        tracing::trace!(
            start = record.start,
            size = record.size,
            program = %program,
            "evaluating frame program"
        );

        let mut evaluator = Evaluator::new(self.word_size).memory(memory);
        for (name, value) in registers.iter() {
            evaluator.set(name, *value);
        }
        evaluator.set(".raSearchStart", record.start as u64);
        evaluator.set(".cbLocals", record.locals_size as u64);
        evaluator.set(".cbParams", record.params_size as u64);
        evaluator.set(".cbSavedRegs", record.saved_regs_size as u64);

        evaluator.process(&program).map_err(|e| {
            tracing::warn!(program = %program, diagnosis = e.diagnosis(), "frame program failed");
            e
        })?;

        for (name, value) in registers.iter_mut() {
            if let Some(updated) = evaluator.get(name) {
                *value = updated;
            }
        }
        Ok(true)
    }
}

fn container(e: MsfError) -> UnwindError {
    UnwindError::with_source(UnwindErrorKind::BadUnwindData, "container read failed", e)
}
