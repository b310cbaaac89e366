//! Single-pass Pratt compiler.
//!
//! Parses and emits bytecode in one pass: there is no AST. Each token
//! kind maps to a parse rule `{prefix, infix, precedence}`; binding
//! powers drive precedence and associativity, and assignability flows
//! down the descent as the `can_assign` flag. Function declarations
//! push a fresh function context; resolving a name walks the context
//! stack and records upvalues on the way out.
//!
//! Errors use panic-mode recovery: after the first error in a statement
//! the compiler stays quiet until it reaches a statement boundary, then
//! resumes. All diagnostics are accumulated and returned together.

use std::fmt;

use lox_core::chunk::{Chunk, OpCode};
use lox_core::object::{Function, Heap, ObjKind, ObjRef};
use lox_core::value::Value;

use crate::scanner::{Scanner, Token, TokenKind};

/// Most locals or upvalues one function can have (slot operands are one
/// byte).
const MAX_SLOTS: usize = 256;
/// Most constants one chunk can hold (pool operands are one byte).
const MAX_CONSTANTS: usize = 256;
/// Most parameters or call arguments.
const MAX_ARITY: usize = 255;

/// A compile diagnostic, rendered `[line N] Error at 'x': message.`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileDiag {
    pub line: u32,
    /// `Some("end")` at EOF, `Some(lexeme)` elsewhere, `None` for
    /// scanner errors (the message already says what was seen).
    pub location: Option<String>,
    pub message: String,
}

impl fmt::Display for CompileDiag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            Some(loc) if loc == "end" => write!(f, " at end")?,
            Some(loc) => write!(f, " at '{loc}'")?,
            None => {}
        }
        write!(f, ": {}", self.message)
    }
}

impl std::error::Error for CompileDiag {}

/// Compile a whole program into a top-level function object.
///
/// On success the returned handle is a `Function` with arity 0 and no
/// name (it prints as `<script>`). On failure every diagnostic found
/// before recovery gave up is returned, in source order.
pub fn compile<'src>(heap: &mut Heap, source: &'src str) -> Result<ObjRef, Vec<CompileDiag>> {
    let mut compiler = Compiler::new(heap, source);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // ()
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

type ParseFn<'src, 'heap> = fn(&mut Compiler<'src, 'heap>, bool);

struct ParseRule<'src, 'heap> {
    prefix: Option<ParseFn<'src, 'heap>>,
    infix: Option<ParseFn<'src, 'heap>>,
    precedence: Precedence,
}

/// The rule table. Token kinds without an entry can start nothing and
/// continue nothing.
fn rule_for<'src, 'heap>(kind: TokenKind) -> ParseRule<'src, 'heap> {
    fn rule<'src, 'heap>(
        prefix: Option<ParseFn<'src, 'heap>>,
        infix: Option<ParseFn<'src, 'heap>>,
        precedence: Precedence,
    ) -> ParseRule<'src, 'heap> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    match kind {
        TokenKind::LeftParen => rule(
            Some(Compiler::grouping),
            Some(Compiler::call),
            Precedence::Call,
        ),
        TokenKind::Minus => rule(
            Some(Compiler::unary),
            Some(Compiler::binary),
            Precedence::Term,
        ),
        TokenKind::Plus => rule(None, Some(Compiler::binary), Precedence::Term),
        TokenKind::Slash | TokenKind::Star => rule(None, Some(Compiler::binary), Precedence::Factor),
        TokenKind::Bang => rule(Some(Compiler::unary), None, Precedence::None),
        TokenKind::BangEqual | TokenKind::EqualEqual => {
            rule(None, Some(Compiler::binary), Precedence::Equality)
        }
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => rule(None, Some(Compiler::binary), Precedence::Comparison),
        TokenKind::Identifier => rule(Some(Compiler::variable), None, Precedence::None),
        TokenKind::String => rule(Some(Compiler::string), None, Precedence::None),
        TokenKind::Number => rule(Some(Compiler::number), None, Precedence::None),
        TokenKind::And => rule(None, Some(Compiler::and_op), Precedence::And),
        TokenKind::Or => rule(None, Some(Compiler::or_op), Precedence::Or),
        TokenKind::False | TokenKind::True | TokenKind::Nil => {
            rule(Some(Compiler::literal), None, Precedence::None)
        }
        _ => rule(None, None, Precedence::None),
    }
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while the initializer is still running.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state; nested `fun` declarations stack
/// these up.
struct FunctionContext<'src> {
    function: Function,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionContext<'src> {
    fn new(name: Option<ObjRef>) -> Self {
        FunctionContext {
            function: Function {
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                name,
            },
            // slot 0 belongs to the closure itself
            locals: vec![Local {
                name: "",
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

pub struct Compiler<'src, 'heap> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    heap: &'heap mut Heap,
    contexts: Vec<FunctionContext<'src>>,
    diags: Vec<CompileDiag>,
    panic_mode: bool,
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    fn new(heap: &'heap mut Heap, source: &'src str) -> Self {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 1,
        };
        Compiler {
            scanner: Scanner::new(source),
            current: placeholder,
            previous: placeholder,
            heap,
            contexts: vec![FunctionContext::new(None)],
            diags: Vec::new(),
            panic_mode: false,
        }
    }

    fn finish(mut self) -> Result<ObjRef, Vec<CompileDiag>> {
        self.emit_return();
        let context = self.contexts.pop().expect("script context");
        if self.diags.is_empty() {
            Ok(self.heap.alloc(ObjKind::Function(context.function)))
        } else {
            Err(self.diags)
        }
    }

    // ---- token plumbing ----

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at(self.current, None, &message);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    // ---- diagnostics ----

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, Some(token.lexeme), message);
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, Some(token.lexeme), message);
    }

    fn error_at(&mut self, token: Token<'src>, location: Option<&str>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let location = match (location, token.kind) {
            (_, TokenKind::Eof) => Some("end".to_string()),
            (Some(lexeme), _) => Some(lexeme.to_string()),
            (None, _) => None,
        };
        self.diags.push(CompileDiag {
            line: token.line,
            location,
            message: message.to_string(),
        });
    }

    /// Leave panic mode at the next statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emission ----

    fn context(&mut self) -> &mut FunctionContext<'src> {
        self.contexts.last_mut().expect("active function context")
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.context().function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op.into());
    }

    fn emit_ops(&mut self, first: OpCode, second: OpCode) {
        self.emit_op(first);
        self.emit_op(second);
    }

    /// Implicit function result is nil.
    fn emit_return(&mut self) {
        self.emit_ops(OpCode::Nil, OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.context().function.chunk.add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_op(OpCode::Constant);
        self.emit_byte(index);
    }

    /// Emit a forward jump with a placeholder operand; returns the
    /// operand's offset for [`Compiler::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.context().function.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the operand itself
        let jump = self.context().function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
            return;
        }
        let bytes = (jump as u16).to_be_bytes();
        let code = &mut self.context().function.chunk.code;
        code[offset] = bytes[0];
        code[offset + 1] = bytes[1];
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.context().function.chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
            return;
        }
        let bytes = (offset as u16).to_be_bytes();
        self.emit_byte(bytes[0]);
        self.emit_byte(bytes[1]);
    }

    // ---- declarations ----

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // a function may refer to itself; it is usable immediately
        self.mark_initialized();
        self.function();
        self.define_variable(global);
    }

    /// Compile a function body in a fresh context and emit the
    /// `Closure` instruction (plus its upvalue descriptor tail) into the
    /// enclosing chunk.
    fn function(&mut self) {
        let name = self.heap.intern(self.previous.lexeme);
        self.contexts.push(FunctionContext::new(Some(name)));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if usize::from(self.context().function.arity) == MAX_ARITY {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.context().function.arity += 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        self.emit_return();
        let context = self.contexts.pop().expect("function context");
        let function = self.heap.alloc(ObjKind::Function(context.function));
        let index = self.make_constant(Value::Obj(function));
        self.emit_op(OpCode::Closure);
        self.emit_byte(index);
        for upvalue in &context.upvalues {
            let is_local = u8::from(upvalue.is_local);
            let index = upvalue.index;
            self.emit_byte(is_local);
            self.emit_byte(index);
        }
    }

    /// Parse a binding name. Locals are declared here (still
    /// uninitialized); globals return their name-constant index.
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.context().scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme;
        self.identifier_constant(name)
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::Obj(handle))
    }

    fn declare_variable(&mut self) {
        if self.context().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let context = self.contexts.last().expect("active function context");
        let shadowed = context
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth == -1 || local.depth >= context.scope_depth)
            .any(|local| local.name == name);
        if shadowed {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.context().locals.len() == MAX_SLOTS {
            self.error("Too many local variables in function.");
            return;
        }
        self.context().locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let context = self.context();
        if context.scope_depth == 0 {
            return;
        }
        let depth = context.scope_depth;
        if let Some(local) = context.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.context().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op(OpCode::DefineGlobal);
        self.emit_byte(global);
    }

    // ---- statements ----

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.context().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.context().scope_depth -= 1;
        loop {
            let context = self.contexts.last().expect("active function context");
            match context.locals.last() {
                Some(local) if local.depth > context.scope_depth => {
                    let captured = local.is_captured;
                    if captured {
                        self.emit_op(OpCode::CloseUpvalue);
                    } else {
                        self.emit_op(OpCode::Pop);
                    }
                    self.context().locals.pop();
                }
                _ => break,
            }
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    /// `return` is legal anywhere, including the top level, where it
    /// becomes the program's result value.
    fn return_statement(&mut self) {
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        // JumpIfFalse leaves the condition on the stack; both arms pop it
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.context().function.chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// Desugars to initializer + while with the increment run after the
    /// body (the body jumps over the increment on the way in).
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.context().function.chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.context().function.chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule_for(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule_for(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule_for(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        // an `=` still sitting here means the target could not take it
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(number) => self.emit_constant(Value::Number(number)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        // trim the surrounding quotes; no escape processing
        let text = &lexeme[1..lexeme.len() - 1];
        let handle = self.heap.intern(text);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(rule_for(operator).precedence.next());
        match operator {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            TokenKind::BangEqual => self.emit_ops(OpCode::Equal, OpCode::Not),
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => self.emit_ops(OpCode::Less, OpCode::Not),
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => self.emit_ops(OpCode::Greater, OpCode::Not),
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    /// Short-circuit and: if the left side is falsey it stays as the
    /// result; otherwise it is popped and the right side takes over.
    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_op(OpCode::Call);
        self.emit_byte(arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARITY {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    /// Resolve a name to a local slot, an upvalue, or a global, and emit
    /// the matching get or set.
    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let top = self.contexts.len() - 1;
        let (get_op, set_op, operand) = if let Some(slot) = self.resolve_local(top, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(top, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, index)
        } else {
            let index = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, index)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_op(set_op);
        } else {
            self.emit_op(get_op);
        }
        self.emit_byte(operand);
    }

    /// Search one context's locals, innermost shadowing outermost.
    fn resolve_local(&mut self, context_index: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (slot, local) in self.contexts[context_index]
            .locals
            .iter()
            .enumerate()
            .rev()
        {
            if local.name == name {
                if local.depth == -1 {
                    uninitialized = true;
                }
                found = Some(slot as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Resolve a name through enclosing function contexts, recording an
    /// upvalue in each context crossed on the way back in.
    fn resolve_upvalue(&mut self, context_index: usize, name: &str) -> Option<u8> {
        if context_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(context_index - 1, name) {
            self.contexts[context_index - 1].locals[usize::from(local)].is_captured = true;
            return self.add_upvalue(context_index, local, true);
        }
        if let Some(upvalue) = self.resolve_upvalue(context_index - 1, name) {
            return self.add_upvalue(context_index, upvalue, false);
        }
        None
    }

    fn add_upvalue(&mut self, context_index: usize, index: u8, is_local: bool) -> Option<u8> {
        let descriptor = UpvalueDesc { index, is_local };
        let context = &self.contexts[context_index];
        if let Some(existing) = context.upvalues.iter().position(|up| *up == descriptor) {
            return Some(existing as u8);
        }
        if context.upvalues.len() == MAX_SLOTS {
            self.error("Too many closure variables in function.");
            return Some(0);
        }
        let context = &mut self.contexts[context_index];
        context.upvalues.push(descriptor);
        context.function.upvalue_count = context.upvalues.len();
        Some((context.upvalues.len() - 1) as u8)
    }
}
