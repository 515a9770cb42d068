use std::collections::HashMap;
use std::convert::TryFrom;
use std::mem;

use crate::chunk::{Instruction, Value};
use crate::error::{CompileErrorKind, LoxError};
use crate::gc::{Gc, GcRef};
use crate::objects::{FunctionUpvalue, LoxFunction};
use crate::scanner::{Scanner, Token, TokenType};

#[derive(Copy, Clone, Debug, PartialOrd, PartialEq)]
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
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(&self) -> Precedence {
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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::None,
        }
    }
}

type ParseFn<'a> = fn(&mut Parser<'a>, can_assign: bool) -> ();

#[derive(Copy, Clone)]
struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

impl<'a> ParseRule<'a> {
    fn new(
        prefix: Option<ParseFn<'a>>,
        infix: Option<ParseFn<'a>>,
        precedence: Precedence,
    ) -> ParseRule<'a> {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

#[derive(Copy, Clone, PartialEq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Copy, Clone)]
struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    is_captured: bool,
}

impl<'a> Local<'a> {
    fn new(name: Token<'a>, depth: i32) -> Self {
        Local {
            name,
            depth,
            is_captured: false,
        }
    }
}

const LOCAL_COUNT: usize = u8::MAX as usize + 1;

struct Compiler<'a> {
    enclosing: Option<Box<Compiler<'a>>>,
    function: LoxFunction,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    errors: Vec<CompileErrorKind>,
    scope_depth: i32,
}

impl<'a> Compiler<'a> {
    fn new(name: GcRef<String>, kind: FunctionType) -> Box<Self> {
        let mut compiler = Compiler {
            enclosing: None,
            function: LoxFunction::new(name),
            function_type: kind,
            locals: Vec::with_capacity(LOCAL_COUNT),
            errors: Vec::new(),
            scope_depth: 0,
        };

        // Slot 0 holds the callee, or the receiver inside methods.
        let receiver = match kind {
            FunctionType::Method | FunctionType::Initializer => Token::synthetic("this"),
            _ => Token::synthetic(""),
        };
        compiler.locals.push(Local::new(receiver, 0));
        Box::new(compiler)
    }

    fn resolve_local(&mut self, name: Token) -> Option<u8> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if name.lexeme == local.name.lexeme {
                if local.depth == -1 {
                    self.errors.push(CompileErrorKind::LocalInOwnInitializer);
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, name: Token) -> Option<u8> {
        if let Some(enclosing) = self.enclosing.as_mut() {
            if let Some(index) = enclosing.resolve_local(name) {
                enclosing.locals[index as usize].is_captured = true;
                return Some(self.add_upvalue(index, true));
            }
            if let Some(index) = enclosing.resolve_upvalue(name) {
                return Some(self.add_upvalue(index, false));
            }
        }
        None
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> u8 {
        for (i, upvalue) in self.function.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i as u8;
            }
        }
        let count = self.function.upvalues.len();

        if count == LOCAL_COUNT {
            self.errors.push(CompileErrorKind::UpvalueLimitExceeded);
            return 0;
        }

        self.function.upvalues.push(FunctionUpvalue { index, is_local });
        count as u8
    }

    fn is_local_declared(&self, name: Token) -> bool {
        for local in self.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.scope_depth {
                return false;
            }
            if local.name.lexeme == name.lexeme {
                return true;
            }
        }
        false
    }
}

struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

impl ClassCompiler {
    fn new(enclosing: Option<Box<ClassCompiler>>) -> Box<Self> {
        Box::new(ClassCompiler {
            enclosing,
            has_superclass: false,
        })
    }
}

pub struct Parser<'a> {
    scanner: Scanner<'a>,
    compiler: Box<Compiler<'a>>,
    class_compiler: Option<Box<ClassCompiler>>,
    gc: &'a mut Gc,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    first_error: Option<CompileErrorKind>,
    panic_mode: bool,
    rules: HashMap<TokenType, ParseRule<'a>>,
}

impl<'a> Parser<'a> {
    pub fn new(code: &'a str, gc: &'a mut Gc) -> Parser<'a> {
        let t1 = Token {
            kind: TokenType::Eof,
            lexeme: "",
            line: 1,
        };

        let t2 = Token {
            kind: TokenType::Eof,
            lexeme: "",
            line: 1,
        };

        let mut rules = HashMap::new();

        let mut rule = |kind, prefix, infix, precedence| {
            rules.insert(kind, ParseRule::new(prefix, infix, precedence));
        };

        rule(
            TokenType::LeftParen,
            Some(Parser::grouping),
            Some(Parser::call),
            Precedence::Call,
        );
        rule(TokenType::RightParen, None, None, Precedence::None);
        rule(TokenType::LeftBrace, None, None, Precedence::None);
        rule(TokenType::RightBrace, None, None, Precedence::None);
        rule(TokenType::LeftSquare, None, None, Precedence::None);
        rule(TokenType::RightSquare, None, None, Precedence::None);
        rule(TokenType::Comma, None, None, Precedence::None);
        rule(TokenType::Dot, None, Some(Parser::dot), Precedence::Call);
        rule(
            TokenType::Minus,
            Some(Parser::unary),
            Some(Parser::binary),
            Precedence::Term,
        );
        rule(
            TokenType::Plus,
            None,
            Some(Parser::binary),
            Precedence::Term,
        );
        rule(TokenType::Semicolon, None, None, Precedence::None);
        rule(
            TokenType::Slash,
            None,
            Some(Parser::binary),
            Precedence::Factor,
        );
        rule(
            TokenType::Star,
            None,
            Some(Parser::binary),
            Precedence::Factor,
        );
        rule(TokenType::Bang, Some(Parser::unary), None, Precedence::None);
        rule(
            TokenType::BangEqual,
            None,
            Some(Parser::binary),
            Precedence::Equality,
        );
        rule(TokenType::Equal, None, None, Precedence::None);
        rule(
            TokenType::EqualEqual,
            None,
            Some(Parser::binary),
            Precedence::Equality,
        );
        rule(
            TokenType::Greater,
            None,
            Some(Parser::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::GreaterEqual,
            None,
            Some(Parser::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::Less,
            None,
            Some(Parser::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::LessEqual,
            None,
            Some(Parser::binary),
            Precedence::Comparison,
        );
        rule(
            TokenType::Identifier,
            Some(Parser::variable),
            None,
            Precedence::None,
        );
        rule(
            TokenType::String,
            Some(Parser::string),
            None,
            Precedence::None,
        );
        rule(
            TokenType::Number,
            Some(Parser::number),
            None,
            Precedence::None,
        );
        rule(TokenType::And, None, Some(Parser::and_op), Precedence::And);
        rule(TokenType::Class, None, None, Precedence::None);
        rule(TokenType::Else, None, None, Precedence::None);
        rule(
            TokenType::False,
            Some(Parser::literal),
            None,
            Precedence::None,
        );
        rule(TokenType::For, None, None, Precedence::None);
        rule(TokenType::Fun, None, None, Precedence::None);
        rule(TokenType::If, None, None, Precedence::None);
        rule(
            TokenType::Nil,
            Some(Parser::literal),
            None,
            Precedence::None,
        );
        rule(TokenType::Or, None, Some(Parser::or_op), Precedence::Or);
        rule(TokenType::Return, None, None, Precedence::None);
        rule(
            TokenType::Super,
            Some(Parser::super_),
            None,
            Precedence::None,
        );
        rule(
            TokenType::This,
            Some(Parser::this_),
            None,
            Precedence::None,
        );
        rule(
            TokenType::True,
            Some(Parser::literal),
            None,
            Precedence::None,
        );
        rule(TokenType::Var, None, None, Precedence::None);
        rule(TokenType::While, None, None, Precedence::None);
        rule(TokenType::Error, None, None, Precedence::None);
        rule(TokenType::Eof, None, None, Precedence::None);

        let script_name = gc.intern(String::new());

        Parser {
            scanner: Scanner::new(code),
            compiler: Compiler::new(script_name, FunctionType::Script),
            class_compiler: None,
            gc,
            current: t1,
            previous: t2,
            had_error: false,
            first_error: None,
            panic_mode: false,
            rules,
        }
    }

    pub fn compile(mut self) -> Result<GcRef<LoxFunction>, LoxError> {
        self.advance();

        while !self.matches(TokenType::Eof) {
            self.declaration();
        }

        self.emit_return();

        #[cfg(feature = "debug_trace_execution")]
        if !self.had_error {
            crate::chunk::Disassembler::new(&self.compiler.function.chunk, None)
                .disassemble("script");
        }

        if self.had_error {
            let kind = self
                .first_error
                .unwrap_or(CompileErrorKind::UnexpectedToken);
            Err(LoxError::CompileError(kind))
        } else {
            Ok(self.gc.alloc(self.compiler.function))
        }
    }

    fn declaration(&mut self) {
        if self.matches(TokenType::Class) {
            self.class_declaration();
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit(Instruction::Class(name_constant));
        self.define_variable(name_constant);

        let old_class_compiler = self.class_compiler.take();
        self.class_compiler = Some(ClassCompiler::new(old_class_compiler));

        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.previous.lexeme {
                self.error_kind(CompileErrorKind::CyclicInheritance);
            }

            // The superclass stays on the stack under a synthetic local
            // so 'super' expressions can reach it.
            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit(Instruction::Inherit);
            if let Some(class_compiler) = self.class_compiler.as_mut() {
                class_compiler.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit(Instruction::Pop);

        let has_superclass = self
            .class_compiler
            .as_ref()
            .map_or(false, |c| c.has_superclass);
        if has_superclass {
            self.end_scope();
        }

        if let Some(class_compiler) = self.class_compiler.take() {
            self.class_compiler = class_compiler.enclosing;
        }
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous);
        let function_type = if self.previous.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit(Instruction::Method(constant));
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn push_compiler(&mut self, kind: FunctionType) {
        let function_name = self.gc.intern(self.previous.lexeme.to_owned());
        let new_compiler = Compiler::new(function_name, kind);
        let old_compiler = mem::replace(&mut self.compiler, new_compiler);
        self.compiler.enclosing = Some(old_compiler);
    }

    fn pop_compiler(&mut self) -> LoxFunction {
        self.emit_return();
        match self.compiler.enclosing.take() {
            Some(enclosing) => {
                let compiler = mem::replace(&mut self.compiler, enclosing);

                #[cfg(feature = "debug_trace_execution")]
                crate::chunk::Disassembler::new(&compiler.function.chunk, None)
                    .disassemble(compiler.function.name.as_str());

                compiler.function
            }
            None => panic!("Didn't find an enclosing compiler"),
        }
    }

    fn function(&mut self, kind: FunctionType) {
        self.push_compiler(kind);
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                self.compiler.function.arity += 1;
                if self.compiler.function.arity > 255 {
                    self.error_at_current("Cannot have more than 255 parameters.");
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();
        let function = self.pop_compiler();
        let fn_id = self.gc.alloc(function);

        let index = self.make_constant(Value::Function(fn_id));
        self.emit(Instruction::Closure(index));
    }

    fn var_declaration(&mut self) {
        let index = self.parse_variable("Expect variable name.");
        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit(Instruction::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(index);
    }

    fn statement(&mut self) {
        if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit(Instruction::Pop);
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn return_statement(&mut self) {
        if let FunctionType::Script = self.compiler.function_type {
            self.error_kind(CompileErrorKind::ReturnOutsideFunction);
        }
        if self.matches(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if let FunctionType::Initializer = self.compiler.function_type {
                self.error_kind(CompileErrorKind::ReturnInsideInitializer);
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit(Instruction::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");
        let then_jump = self.emit(Instruction::JumpIfFalse(0xffff));
        self.emit(Instruction::Pop);
        self.statement();
        let else_jump = self.emit(Instruction::Jump(0xffff));
        self.patch_jump(then_jump);
        self.emit(Instruction::Pop);
        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.start_loop();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");
        let exit_jump = self.emit(Instruction::JumpIfFalse(0xffff));
        self.emit(Instruction::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Instruction::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");

        // Initializer
        if self.matches(TokenType::Semicolon) {
            // no initializer
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }
        let mut loop_start = self.start_loop();

        // Condition
        let mut exit_jump = Option::None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            let jump = self.emit(Instruction::JumpIfFalse(0xffff));
            exit_jump = Option::from(jump);
            self.emit(Instruction::Pop);
        }

        // Increment
        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit(Instruction::Jump(0xffff));
            let increment_start = self.start_loop();
            self.expression();
            self.emit(Instruction::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }
        self.statement();
        self.emit_loop(loop_start);
        if let Option::Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Instruction::Pop);
        }
        self.end_scope();
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.compiler.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.compiler.scope_depth -= 1;
        for i in (0..self.compiler.locals.len()).rev() {
            if self.compiler.locals[i].depth > self.compiler.scope_depth {
                if self.compiler.locals[i].is_captured {
                    self.emit(Instruction::CloseUpvalue);
                } else {
                    self.emit(Instruction::Pop);
                }
                self.compiler.locals.pop();
            }
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("Parsed value is not a double");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let value = &lexeme[1..(lexeme.len() - 1)];
        let s = self.gc.intern(value.to_owned());
        self.emit_constant(Value::String(s));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenType::False => self.emit(Instruction::False),
            TokenType::True => self.emit(Instruction::True),
            TokenType::Nil => self.emit(Instruction::Nil),
            _ => panic!("Unreachable literal"),
        };
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_compiler.is_none() {
            self.error_kind(CompileErrorKind::ThisOutsideClass);
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.class_compiler.as_ref() {
            Some(class_compiler) => {
                if !class_compiler.has_superclass {
                    self.error_kind(CompileErrorKind::SuperInClassWithNoSuperclass);
                }
            }
            None => self.error_kind(CompileErrorKind::SuperOutsideClass),
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous);

        self.named_variable(Token::synthetic("this"), false);
        if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit(Instruction::SuperInvoke((name, arg_count)));
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit(Instruction::GetSuper(name));
        }
    }

    fn named_variable(&mut self, name: Token<'a>, can_assign: bool) {
        let get_op;
        let set_op;
        if let Some(arg) = self.resolve_local(name) {
            get_op = Instruction::GetLocal(arg);
            set_op = Instruction::SetLocal(arg);
        } else if let Some(arg) = self.resolve_upvalue(name) {
            get_op = Instruction::GetUpvalue(arg);
            set_op = Instruction::SetUpvalue(arg);
        } else {
            let index = self.identifier_constant(name);
            get_op = Instruction::GetGlobal(index);
            set_op = Instruction::SetGlobal(index);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
    }

    fn resolve_local(&mut self, name: Token<'a>) -> Option<u8> {
        let result = self.compiler.resolve_local(name);
        self.drain_resolver_errors();
        result
    }

    fn resolve_upvalue(&mut self, name: Token<'a>) -> Option<u8> {
        let result = self.compiler.resolve_upvalue(name);
        self.drain_resolver_errors();
        result
    }

    // Resolution walks the whole compiler chain, so errors can land in
    // any enclosing compiler.
    fn drain_resolver_errors(&mut self) {
        let mut kinds = Vec::new();
        let mut compiler = Some(self.compiler.as_mut());
        while let Some(current) = compiler {
            kinds.append(&mut current.errors);
            compiler = current.enclosing.as_mut().map(|e| e.as_mut());
        }
        for kind in kinds {
            self.error_kind(kind);
        }
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit(Instruction::Call(arg_count));
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous);

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit(Instruction::SetProperty(name));
        } else if self.matches(TokenType::LeftParen) {
            let arg_count = self.argument_list();
            self.emit(Instruction::Invoke((name, arg_count)));
        } else {
            self.emit(Instruction::GetProperty(name));
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();

                if count == 255 {
                    self.error("Cannot have more than 255 arguments.");
                }

                count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Bang => self.emit(Instruction::Not),
            TokenType::Minus => self.emit(Instruction::Negate),
            _ => panic!("Invalid unary operator"),
        };
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = self.get_rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenType::Plus => self.emit(Instruction::Add),
            TokenType::Minus => self.emit(Instruction::Subtract),
            TokenType::Star => self.emit(Instruction::Multiply),
            TokenType::Slash => self.emit(Instruction::Divide),
            TokenType::BangEqual => self.emit_two(Instruction::Equal, Instruction::Not),
            TokenType::EqualEqual => self.emit(Instruction::Equal),
            TokenType::Greater => self.emit(Instruction::Greater),
            TokenType::GreaterEqual => self.emit_two(Instruction::Less, Instruction::Not),
            TokenType::Less => self.emit(Instruction::Less),
            TokenType::LessEqual => self.emit_two(Instruction::Greater, Instruction::Not),

            _ => panic!("Invalid binary operator"),
        };
    }

    fn and_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit(Instruction::JumpIfFalse(0xffff));
        self.emit(Instruction::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_op(&mut self, _can_assign: bool) {
        let end_jump = self.emit(Instruction::JumpIfTrue(0xffff));
        self.emit(Instruction::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix_rule = self.get_rule(self.previous.kind).prefix;

        let prefix_rule = match prefix_rule {
            Some(rule) => rule,
            None => {
                self.error("Expect expression.");
                return;
            }
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign);

        while self.is_lower_precedence(precedence) {
            self.advance();
            let infix_rule = self.get_rule(self.previous.kind).infix.unwrap();
            infix_rule(self, can_assign);
        }

        if can_assign && self.matches(TokenType::Equal) {
            self.error_kind(CompileErrorKind::InvalidAssignmentTarget);
        }
    }

    fn parse_variable(&mut self, msg: &str) -> u8 {
        self.consume(TokenType::Identifier, msg);

        self.declare_variable();
        if self.compiler.scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.previous)
    }

    fn identifier_constant(&mut self, token: Token) -> u8 {
        let identifier = self.gc.intern(token.lexeme.to_owned());
        let value = Value::String(identifier);
        self.make_constant(value)
    }

    fn declare_variable(&mut self) {
        // Global variables are implicitly declared.
        if self.compiler.scope_depth == 0 {
            return;
        }
        let name = self.previous;
        if self.compiler.is_local_declared(name) {
            self.error_kind(CompileErrorKind::RedefinedInSameScope);
        }
        self.add_local(name);
    }

    fn add_local(&mut self, token: Token<'a>) {
        if self.compiler.locals.len() == LOCAL_COUNT {
            self.error_kind(CompileErrorKind::LocalLimitExceeded);
            return;
        }
        let local = Local::new(token, -1);
        self.compiler.locals.push(local);
    }

    fn define_variable(&mut self, index: u8) {
        if self.compiler.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(Instruction::DefineGlobal(index));
    }

    fn mark_initialized(&mut self) {
        if self.compiler.scope_depth == 0 {
            return;
        }
        let last_local = self.compiler.locals.last_mut().expect("Missing local");
        last_local.depth = self.compiler.scope_depth;
    }

    fn is_lower_precedence(&self, precedence: Precedence) -> bool {
        let current_precedence = self.get_rule(self.current.kind).precedence;
        precedence <= current_precedence
    }

    fn consume(&mut self, expected: TokenType, msg: &str) {
        if self.current.kind == expected {
            self.advance();
            return;
        }

        self.error_at_current(msg);
    }

    fn advance(&mut self) {
        self.previous = self.current;

        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind == TokenType::Error {
                self.error_at_current(self.current.lexeme);
            } else {
                break;
            }
        }
    }

    fn matches(&mut self, kind: TokenType) -> bool {
        if !self.check(kind) {
            false
        } else {
            self.advance();
            true
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.current.kind == kind
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, CompileErrorKind::UnexpectedToken, msg)
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, CompileErrorKind::UnexpectedToken, msg)
    }

    fn error_kind(&mut self, kind: CompileErrorKind) {
        self.error_at(self.previous, kind, kind.message())
    }

    fn error_at(&mut self, token: Token, kind: CompileErrorKind, msg: &str) {
        if self.panic_mode {
            return;
        }

        self.had_error = true;
        self.panic_mode = true;
        if self.first_error.is_none() {
            self.first_error = Some(kind);
        }
        eprint!("[line {}] Error", token.line);
        match token.kind {
            TokenType::Eof => eprint!(" at end"),
            TokenType::Error => (),
            _ => eprint!(" at '{}'", token.lexeme),
        }
        eprintln!(": {}", msg);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.previous.kind != TokenType::Eof {
            if self.previous.kind == TokenType::Semicolon {
                return;
            }

            match self.current.kind {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Return => return,
                _ => (),
            }

            self.advance()
        }
    }

    fn emit(&mut self, instruction: Instruction) -> usize {
        self.compiler
            .function
            .chunk
            .write(instruction, self.previous.line)
    }

    fn emit_two(&mut self, i1: Instruction, i2: Instruction) -> usize {
        self.compiler.function.chunk.write(i1, self.previous.line);
        self.compiler.function.chunk.write(i2, self.previous.line)
    }

    fn emit_return(&mut self) {
        if let FunctionType::Initializer = self.compiler.function_type {
            self.emit(Instruction::GetLocal(0));
        } else {
            self.emit(Instruction::Nil);
        }
        self.emit(Instruction::Return);
    }

    fn start_loop(&self) -> usize {
        self.compiler.function.chunk.code.len()
    }

    fn emit_loop(&mut self, start_pos: usize) {
        let offset = self.compiler.function.chunk.code.len() - start_pos;
        let offset = match u16::try_from(offset) {
            Ok(offset) => offset,
            Err(_) => {
                self.error_kind(CompileErrorKind::LoopLimitExceeded);
                0xffff
            }
        };
        self.emit(Instruction::Loop(offset));
    }

    fn patch_jump(&mut self, pos: usize) {
        let offset = self.compiler.function.chunk.code.len() - 1 - pos;
        let offset = match u16::try_from(offset) {
            Ok(offset) => offset,
            Err(_) => {
                self.error_kind(CompileErrorKind::JumpLimitExceeded);
                0xffff
            }
        };

        match self.compiler.function.chunk.code[pos] {
            Instruction::JumpIfFalse(ref mut o) => *o = offset,
            Instruction::JumpIfTrue(ref mut o) => *o = offset,
            Instruction::Jump(ref mut o) => *o = offset,
            _ => panic!("Instruction at position is not jump"),
        }
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.compiler.function.chunk.add_constant(value);
        match u8::try_from(index) {
            Ok(index) => index,
            Err(_) => {
                self.error_kind(CompileErrorKind::ConstantLimitExceeded);
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit(Instruction::Constant(index));
    }

    fn get_rule(&self, kind: TokenType) -> ParseRule<'a> {
        self.rules.get(&kind).cloned().expect("Unknown token kind")
    }
}

#[cfg(test)]
mod tests {
    use super::Parser;
    use crate::chunk::{Instruction, Value};
    use crate::error::{CompileErrorKind, LoxError};
    use crate::gc::Gc;

    fn compile_error(code: &str) -> CompileErrorKind {
        let mut gc = Gc::new();
        match Parser::new(code, &mut gc).compile() {
            Err(LoxError::CompileError(kind)) => kind,
            Err(_) => panic!("Expected a compile error"),
            Ok(_) => panic!("Expected compilation to fail"),
        }
    }

    #[test]
    fn script_function_shape() {
        let mut gc = Gc::new();
        let function = Parser::new("var a = 1;", &mut gc)
            .compile()
            .expect("Compilation failed");
        assert_eq!(function.arity, 0);
        assert!(function.name.is_empty());
        assert!(matches!(
            function.chunk.code.last(),
            Some(Instruction::Return)
        ));
    }

    #[test]
    fn closures_record_upvalues() {
        let mut gc = Gc::new();
        let code = "
            fun outer() {
                var x = 1;
                fun inner() { return x; }
                return inner;
            }";
        let script = Parser::new(code, &mut gc)
            .compile()
            .expect("Compilation failed");

        let outer = script
            .chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Function(f) => Some(*f),
                _ => None,
            })
            .expect("Missing outer function constant");
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|value| match value {
                Value::Function(f) => Some(*f),
                _ => None,
            })
            .expect("Missing inner function constant");

        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.upvalues[0].is_local);
        assert_eq!(inner.upvalues[0].index, 1);
        assert!(outer.upvalues.is_empty());
    }

    #[test]
    fn local_limit() {
        let mut code = String::from("fun f() {\n");
        for i in 0..300 {
            code.push_str(&format!("var l{} = nil;\n", i));
        }
        code.push_str("}\n");
        assert_eq!(
            compile_error(&code),
            CompileErrorKind::LocalLimitExceeded
        );
    }

    #[test]
    fn constant_limit() {
        let code = "7;".repeat(300);
        assert_eq!(
            compile_error(&code),
            CompileErrorKind::ConstantLimitExceeded
        );
    }

    #[test]
    fn jump_limit() {
        let mut code = String::from("if (true) {");
        code.push_str(&"nil;".repeat(40_000));
        code.push_str("}");
        assert_eq!(compile_error(&code), CompileErrorKind::JumpLimitExceeded);
    }

    #[test]
    fn loop_limit() {
        let mut code = String::from("while (true) {");
        code.push_str(&"nil;".repeat(40_000));
        code.push_str("}");
        assert_eq!(compile_error(&code), CompileErrorKind::LoopLimitExceeded);
    }

    #[test]
    fn cyclic_inheritance() {
        assert_eq!(
            compile_error("class A < A {}"),
            CompileErrorKind::CyclicInheritance
        );
    }

    #[test]
    fn return_outside_function() {
        assert_eq!(
            compile_error("return;"),
            CompileErrorKind::ReturnOutsideFunction
        );
    }

    #[test]
    fn return_value_inside_initializer() {
        assert_eq!(
            compile_error("class A { init() { return 1; } }"),
            CompileErrorKind::ReturnInsideInitializer
        );
    }

    #[test]
    fn bare_return_inside_initializer_is_fine() {
        let mut gc = Gc::new();
        let result = Parser::new("class A { init() { return; } }", &mut gc).compile();
        assert!(result.is_ok());
    }

    #[test]
    fn this_outside_class() {
        assert_eq!(compile_error("this;"), CompileErrorKind::ThisOutsideClass);
    }

    #[test]
    fn super_outside_class() {
        assert_eq!(
            compile_error("super.m();"),
            CompileErrorKind::SuperOutsideClass
        );
    }

    #[test]
    fn super_without_superclass() {
        assert_eq!(
            compile_error("class A { m() { super.m(); } }"),
            CompileErrorKind::SuperInClassWithNoSuperclass
        );
    }

    #[test]
    fn invalid_assignment_target() {
        assert_eq!(
            compile_error("1 = 2;"),
            CompileErrorKind::InvalidAssignmentTarget
        );
        assert_eq!(
            compile_error("var a; var b; a + b = 1;"),
            CompileErrorKind::InvalidAssignmentTarget
        );
    }

    #[test]
    fn redefined_in_same_scope() {
        assert_eq!(
            compile_error("{ var a = 1; var a = 2; }"),
            CompileErrorKind::RedefinedInSameScope
        );
    }

    #[test]
    fn local_in_own_initializer() {
        assert_eq!(
            compile_error("{ var a = a; }"),
            CompileErrorKind::LocalInOwnInitializer
        );
    }

    #[test]
    fn unexpected_token() {
        assert_eq!(
            compile_error("var 1 = 2;"),
            CompileErrorKind::UnexpectedToken
        );
    }
}
