//! The instruction set that processes run: the parsed representation, the
//! textual parser used by `screen -c`, and the pseudorandom generator used
//! for spawned processes.

use rand::Rng;

/// FOR nesting beyond this depth is a logged no-op.
pub const MAX_LOOP_DEPTH: usize = 3;

/// Custom programs accept 1..=50 instructions.
pub const MAX_CUSTOM_INSTRUCTIONS: usize = 50;

/// An instruction operand: a literal 16-bit value or a variable reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Literal(u16),
    Var(String),
}

/// A PRINT template: a plain literal, or a literal with a trailing variable
/// reference joined by `" + "` in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintTemplate {
    Literal(String),
    Concat { literal: String, var: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Print(PrintTemplate),
    Declare { name: String, value: Operand },
    Add { dst: String, a: Operand, b: Operand },
    Subtract { dst: String, a: Operand, b: Operand },
    Sleep { ticks: u8 },
    For { iterations: u32 },
    EndLoop,
    Read { var: String, address: usize },
    Write { address: usize, value: Operand },
}

/// Parses one textual instruction. Unknown opcodes (and known opcodes with
/// unusable arguments) fall back to a PRINT of the raw text.
pub fn parse_instruction(text: &str) -> Instruction {
    let text = text.trim();
    let (opcode, rest) = split_opcode(text);
    let fallback = || Instruction::Print(PrintTemplate::Literal(text.to_owned()));
    match opcode.to_ascii_uppercase().as_str() {
        "PRINT" => Instruction::Print(parse_template(rest)),
        "DECLARE" => {
            let args = split_args(rest);
            match args.as_slice() {
                [name, value] => Instruction::Declare {
                    name: (*name).to_owned(),
                    value: parse_operand(value),
                },
                _ => fallback(),
            }
        }
        "ADD" | "SUBTRACT" => {
            let args = split_args(rest);
            let [dst, a, b] = args.as_slice() else {
                return fallback();
            };
            let (dst, a, b) = ((*dst).to_owned(), parse_operand(a), parse_operand(b));
            if opcode.eq_ignore_ascii_case("ADD") {
                Instruction::Add { dst, a, b }
            } else {
                Instruction::Subtract { dst, a, b }
            }
        }
        "SLEEP" => match split_args(rest).as_slice() {
            [ticks] => match ticks.parse() {
                Ok(ticks) => Instruction::Sleep { ticks },
                Err(_) => fallback(),
            },
            _ => fallback(),
        },
        "FOR" => match split_args(rest).as_slice() {
            [iterations] => match iterations.parse() {
                Ok(iterations) => Instruction::For { iterations },
                Err(_) => fallback(),
            },
            _ => fallback(),
        },
        "ENDLOOP" => Instruction::EndLoop,
        "READ" => match split_args(rest).as_slice() {
            [var, address] => match parse_address(address) {
                Some(address) => Instruction::Read {
                    var: (*var).to_owned(),
                    address,
                },
                None => fallback(),
            },
            _ => fallback(),
        },
        "WRITE" => match split_args(rest).as_slice() {
            [address, value] => match parse_address(address) {
                Some(address) => Instruction::Write {
                    address,
                    value: parse_operand(value),
                },
                None => fallback(),
            },
            _ => fallback(),
        },
        _ => fallback(),
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal address.
pub fn parse_address(text: &str) -> Option<usize> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

/// The number of burst increments a full run of `program` dispatches:
/// one per instruction, with FOR bodies multiplied by their iteration count
/// and each ENDLOOP counted once. Custom processes use this as their
/// total burst so they finish exactly when the program does.
pub fn dispatch_cost(program: &[Instruction]) -> u32 {
    let (cost, _) = sequence_cost(program, 0, false);
    cost.min(u32::MAX as u64) as u32
}

fn sequence_cost(program: &[Instruction], start: usize, stop_at_endloop: bool) -> (u64, usize) {
    let mut cost: u64 = 0;
    let mut i = start;
    while i < program.len() {
        match &program[i] {
            Instruction::For { iterations } => {
                let (body, end) = sequence_cost(program, i + 1, true);
                // the body executes at least once even for FOR 0
                cost += 1 + u64::from(*iterations).max(1) * body;
                if matches!(program.get(end), Some(Instruction::EndLoop)) {
                    cost += 1;
                    i = end + 1;
                } else {
                    i = end; // unterminated loop body
                }
            }
            Instruction::EndLoop => {
                if stop_at_endloop {
                    return (cost, i);
                }
                cost += 1; // stray ENDLOOP executes once as an error
                i += 1;
            }
            _ => {
                cost += 1;
                i += 1;
            }
        }
    }
    (cost, i)
}

/// Generates a pseudorandom program of exactly `total_burst` instructions.
/// At each position there is a 1-in-10 chance to open a FOR (while nesting
/// stays below [`MAX_LOOP_DEPTH`] and more than two instructions of budget
/// remain); generated loops always close.
pub fn generate(name: &str, total_burst: u32, rng: &mut impl Rng) -> Vec<Instruction> {
    let mut program = Vec::with_capacity(total_burst as usize);
    generate_block(&mut program, total_burst as usize, 0, name, rng);
    program
}

fn generate_block(
    program: &mut Vec<Instruction>,
    budget: usize,
    depth: usize,
    name: &str,
    rng: &mut impl Rng,
) {
    let end = program.len() + budget;
    while program.len() < end {
        let remaining = end - program.len();
        if depth < MAX_LOOP_DEPTH && remaining > 2 && rng.gen_range(0..10) == 0 {
            let body = rng.gen_range(1..=remaining - 2);
            program.push(Instruction::For {
                iterations: rng.gen_range(2..=5),
            });
            generate_block(program, body, depth + 1, name, rng);
            program.push(Instruction::EndLoop);
        } else {
            program.push(random_plain_instruction(name, rng));
        }
    }
}

fn random_plain_instruction(name: &str, rng: &mut impl Rng) -> Instruction {
    match rng.gen_range(0..7) {
        0 => Instruction::Print(PrintTemplate::Literal(format!(
            "Hello world from {}!",
            name
        ))),
        1 => Instruction::Declare {
            name: random_var(rng),
            value: Operand::Literal(rng.gen_range(0..100)),
        },
        2 => Instruction::Add {
            dst: random_var(rng),
            a: Operand::Var(random_var(rng)),
            b: Operand::Var(random_var(rng)),
        },
        3 => Instruction::Subtract {
            dst: random_var(rng),
            a: Operand::Var(random_var(rng)),
            b: Operand::Var(random_var(rng)),
        },
        4 => Instruction::Sleep {
            ticks: rng.gen_range(1..=5),
        },
        5 => Instruction::Read {
            var: random_var(rng),
            address: random_address(rng),
        },
        _ => Instruction::Write {
            address: random_address(rng),
            value: Operand::Literal(rng.gen_range(0..100)),
        },
    }
}

fn random_var(rng: &mut impl Rng) -> String {
    char::from(b'a' + rng.gen_range(0..26)).to_string()
}

fn random_address(rng: &mut impl Rng) -> usize {
    rng.gen_range(0x1000..=0x2000)
}

fn split_opcode(text: &str) -> (&str, &str) {
    let end = text
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(text.len());
    let (opcode, rest) = text.split_at(end);
    (opcode, strip_parens(rest.trim()))
}

fn strip_parens(text: &str) -> &str {
    if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        inner.trim()
    } else {
        text
    }
}

fn split_args(rest: &str) -> Vec<&str> {
    if rest.contains(',') {
        rest.split(',').map(str::trim).filter(|a| !a.is_empty()).collect()
    } else {
        rest.split_whitespace().collect()
    }
}

fn parse_operand(text: &str) -> Operand {
    let text = text.trim();
    if text.chars().all(|c| c.is_ascii_digit()) && !text.is_empty() {
        Operand::Literal(text.parse::<u32>().unwrap_or(0) as u16)
    } else {
        Operand::Var(text.to_owned())
    }
}

fn parse_template(rest: &str) -> PrintTemplate {
    if let Some(split) = rest.rfind(" + ") {
        let (literal, var) = rest.split_at(split);
        let var = var[" + ".len()..].trim();
        if !var.is_empty() && var.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return PrintTemplate::Concat {
                literal: strip_quotes(literal.trim()).to_owned(),
                var: var.to_owned(),
            };
        }
    }
    PrintTemplate::Literal(strip_quotes(rest).to_owned())
}

fn strip_quotes(text: &str) -> &str {
    text.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text)
}
