/// AST node types for the script language.
/// Each node represents a syntactic element; the parser that produces them
/// lives outside this crate, so the constructor helpers at the bottom are the
/// usual way fixtures and demos build trees.
use std::rc::Rc;

#[derive(Clone, Debug, PartialEq)]
pub enum Statement {
    Empty,
    Expression(Expression),
    Block(Vec<Statement>),
    Variable(VariableDeclaration),
    If(IfStatement),
    While(WhileStatement),
    DoWhile(DoWhileStatement),
    For(ForStatement),
    ForIn(ForInStatement),
    ForOf(ForOfStatement),
    Return(Option<Expression>),
    Break(Option<String>),
    Continue(Option<String>),
    Throw(Expression),
    Try(TryStatement),
    Switch(SwitchStatement),
    Labeled(String, Box<Statement>),
    FunctionDeclaration(FunctionDecl),
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDeclaration {
    pub kind: VarKind,
    pub declarations: Vec<VariableDeclarator>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarKind {
    Var,
    Let,
    Const,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VariableDeclarator {
    pub pattern: Pattern,
    pub init: Option<Expression>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
    Identifier(String),
    Array(Vec<Option<ArrayPatternElement>>),
    Object(Vec<ObjectPatternProperty>),
    Assign(Box<Pattern>, Box<Expression>),
    Rest(Box<Pattern>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArrayPatternElement {
    Pattern(Pattern),
    Rest(Pattern),
}

#[derive(Clone, Debug, PartialEq)]
pub enum ObjectPatternProperty {
    KeyValue(PropertyKey, Pattern),
    Shorthand(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expression {
    Literal(Literal),
    Identifier(String),
    This,
    Array(Vec<Option<Expression>>),
    Object(Vec<Property>),
    Function(FunctionExpr),
    ArrowFunction(ArrowFunction),
    Unary(UnaryOp, Box<Expression>),
    Binary(BinaryOp, Box<Expression>, Box<Expression>),
    Logical(LogicalOp, Box<Expression>, Box<Expression>),
    Update(UpdateOp, bool, Box<Expression>), // op, prefix, argument
    Assign(AssignOp, Box<Expression>, Box<Expression>),
    Conditional(Box<Expression>, Box<Expression>, Box<Expression>),
    Call(Box<Expression>, Vec<Expression>),
    New(Box<Expression>, Vec<Expression>),
    Member(Box<Expression>, MemberProperty),
    Sequence(Vec<Expression>),
    Spread(Box<Expression>),
    Yield(Option<Box<Expression>>, bool), // expr, delegate
    Await(Box<Expression>),
    Typeof(Box<Expression>),
    Void(Box<Expression>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum MemberProperty {
    Dot(String),
    Computed(Box<Expression>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
    Null,
    Boolean(bool),
    Number(f64),
    String(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Minus,
    Plus,
    Not,
    BitNot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Exp,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    LShift,
    RShift,
    URShift,
    BitAnd,
    BitOr,
    BitXor,
    In,
    Instanceof,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    NullishCoalescing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateOp {
    Increment,
    Decrement,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    DivAssign,
    ModAssign,
}

impl AssignOp {
    /// The binary operator a compound assignment applies, `None` for `=`.
    pub fn binary_op(self) -> Option<BinaryOp> {
        match self {
            AssignOp::Assign => None,
            AssignOp::AddAssign => Some(BinaryOp::Add),
            AssignOp::SubAssign => Some(BinaryOp::Sub),
            AssignOp::MulAssign => Some(BinaryOp::Mul),
            AssignOp::DivAssign => Some(BinaryOp::Div),
            AssignOp::ModAssign => Some(BinaryOp::Mod),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Property {
    pub key: PropertyKey,
    pub value: Expression,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PropertyKey {
    Identifier(String),
    String(String),
    Number(f64),
    Computed(Box<Expression>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct IfStatement {
    pub test: Expression,
    pub consequent: Box<Statement>,
    pub alternate: Option<Box<Statement>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhileStatement {
    pub test: Expression,
    pub body: Box<Statement>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DoWhileStatement {
    pub test: Expression,
    pub body: Box<Statement>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForStatement {
    pub init: Option<ForInit>,
    pub test: Option<Expression>,
    pub update: Option<Expression>,
    pub body: Box<Statement>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ForInit {
    Variable(VariableDeclaration),
    Expression(Expression),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForInStatement {
    pub left: ForInOfLeft,
    pub right: Expression,
    pub body: Box<Statement>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ForOfStatement {
    pub left: ForInOfLeft,
    pub right: Expression,
    pub body: Box<Statement>,
    pub is_await: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ForInOfLeft {
    Variable(VarKind, Pattern),
    Pattern(Pattern),
}

#[derive(Clone, Debug, PartialEq)]
pub struct TryStatement {
    pub block: Vec<Statement>,
    pub handler: Option<CatchClause>,
    pub finalizer: Option<Vec<Statement>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CatchClause {
    pub param: Option<Pattern>,
    pub body: Vec<Statement>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchStatement {
    pub discriminant: Expression,
    pub cases: Vec<SwitchCase>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SwitchCase {
    pub test: Option<Expression>,
    pub consequent: Vec<Statement>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionDecl {
    pub name: String,
    pub params: Vec<Pattern>,
    pub body: Rc<[Statement]>,
    pub is_async: bool,
    pub is_generator: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FunctionExpr {
    pub name: Option<String>,
    pub params: Vec<Pattern>,
    pub body: Rc<[Statement]>,
    pub is_async: bool,
    pub is_generator: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArrowFunction {
    pub params: Vec<Pattern>,
    pub body: ArrowBody,
    pub is_async: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArrowBody {
    Expression(Box<Expression>),
    Block(Rc<[Statement]>),
}

// Constructor helpers. Trees built by hand are verbose; these keep fixtures
// readable without pretending to be a parser.

impl Expression {
    pub fn num(n: f64) -> Self {
        Expression::Literal(Literal::Number(n))
    }

    pub fn string(s: &str) -> Self {
        Expression::Literal(Literal::String(s.to_string()))
    }

    pub fn boolean(b: bool) -> Self {
        Expression::Literal(Literal::Boolean(b))
    }

    pub fn ident(name: &str) -> Self {
        Expression::Identifier(name.to_string())
    }

    pub fn yield_(arg: Expression) -> Self {
        Expression::Yield(Some(Box::new(arg)), false)
    }

    pub fn yield_empty() -> Self {
        Expression::Yield(None, false)
    }

    pub fn yield_star(arg: Expression) -> Self {
        Expression::Yield(Some(Box::new(arg)), true)
    }

    pub fn await_(arg: Expression) -> Self {
        Expression::Await(Box::new(arg))
    }

    pub fn binary(op: BinaryOp, left: Expression, right: Expression) -> Self {
        Expression::Binary(op, Box::new(left), Box::new(right))
    }

    pub fn logical(op: LogicalOp, left: Expression, right: Expression) -> Self {
        Expression::Logical(op, Box::new(left), Box::new(right))
    }

    pub fn assign(target: Expression, value: Expression) -> Self {
        Expression::Assign(AssignOp::Assign, Box::new(target), Box::new(value))
    }

    pub fn call(callee: Expression, args: Vec<Expression>) -> Self {
        Expression::Call(Box::new(callee), args)
    }

    pub fn member(object: Expression, name: &str) -> Self {
        Expression::Member(Box::new(object), MemberProperty::Dot(name.to_string()))
    }

    pub fn index(object: Expression, key: Expression) -> Self {
        Expression::Member(Box::new(object), MemberProperty::Computed(Box::new(key)))
    }

    /// `object.method(args)`
    pub fn method_call(object: Expression, method: &str, args: Vec<Expression>) -> Self {
        Expression::call(Expression::member(object, method), args)
    }

    pub fn array(elements: Vec<Expression>) -> Self {
        Expression::Array(elements.into_iter().map(Some).collect())
    }

    pub fn object(props: Vec<(&str, Expression)>) -> Self {
        Expression::Object(
            props
                .into_iter()
                .map(|(k, v)| Property {
                    key: PropertyKey::Identifier(k.to_string()),
                    value: v,
                })
                .collect(),
        )
    }

    pub fn not(arg: Expression) -> Self {
        Expression::Unary(UnaryOp::Not, Box::new(arg))
    }

    pub fn postfix_increment(target: Expression) -> Self {
        Expression::Update(UpdateOp::Increment, false, Box::new(target))
    }

    pub fn function(f: FunctionExpr) -> Self {
        Expression::Function(f)
    }

    pub fn arrow(params: &[&str], body: Expression) -> Self {
        Expression::ArrowFunction(ArrowFunction {
            params: params.iter().map(|p| Pattern::ident(p)).collect(),
            body: ArrowBody::Expression(Box::new(body)),
            is_async: false,
        })
    }
}

impl Pattern {
    pub fn ident(name: &str) -> Self {
        Pattern::Identifier(name.to_string())
    }
}

impl Statement {
    pub fn expr(e: Expression) -> Self {
        Statement::Expression(e)
    }

    fn declare(kind: VarKind, name: &str, init: Option<Expression>) -> Self {
        Statement::Variable(VariableDeclaration {
            kind,
            declarations: vec![VariableDeclarator {
                pattern: Pattern::ident(name),
                init,
            }],
        })
    }

    pub fn let_(name: &str, init: Expression) -> Self {
        Self::declare(VarKind::Let, name, Some(init))
    }

    pub fn const_(name: &str, init: Expression) -> Self {
        Self::declare(VarKind::Const, name, Some(init))
    }

    pub fn var(name: &str, init: Option<Expression>) -> Self {
        Self::declare(VarKind::Var, name, init)
    }

    pub fn return_(arg: Option<Expression>) -> Self {
        Statement::Return(arg)
    }

    pub fn throw(arg: Expression) -> Self {
        Statement::Throw(arg)
    }

    pub fn if_(test: Expression, consequent: Statement, alternate: Option<Statement>) -> Self {
        Statement::If(IfStatement {
            test,
            consequent: Box::new(consequent),
            alternate: alternate.map(Box::new),
        })
    }

    pub fn while_(test: Expression, body: Vec<Statement>) -> Self {
        Statement::While(WhileStatement {
            test,
            body: Box::new(Statement::Block(body)),
        })
    }

    pub fn do_while(body: Vec<Statement>, test: Expression) -> Self {
        Statement::DoWhile(DoWhileStatement {
            test,
            body: Box::new(Statement::Block(body)),
        })
    }

    pub fn for_of(kind: VarKind, name: &str, right: Expression, body: Vec<Statement>) -> Self {
        Statement::ForOf(ForOfStatement {
            left: ForInOfLeft::Variable(kind, Pattern::ident(name)),
            right,
            body: Box::new(Statement::Block(body)),
            is_await: false,
        })
    }

    pub fn for_await_of(name: &str, right: Expression, body: Vec<Statement>) -> Self {
        Statement::ForOf(ForOfStatement {
            left: ForInOfLeft::Variable(VarKind::Const, Pattern::ident(name)),
            right,
            body: Box::new(Statement::Block(body)),
            is_await: true,
        })
    }

    pub fn try_(
        block: Vec<Statement>,
        handler: Option<(Option<&str>, Vec<Statement>)>,
        finalizer: Option<Vec<Statement>>,
    ) -> Self {
        Statement::Try(TryStatement {
            block,
            handler: handler.map(|(param, body)| CatchClause {
                param: param.map(Pattern::ident),
                body,
            }),
            finalizer,
        })
    }

    pub fn labeled(label: &str, body: Statement) -> Self {
        Statement::Labeled(label.to_string(), Box::new(body))
    }

    pub fn break_(label: Option<&str>) -> Self {
        Statement::Break(label.map(str::to_string))
    }

    pub fn continue_(label: Option<&str>) -> Self {
        Statement::Continue(label.map(str::to_string))
    }
}

impl FunctionExpr {
    pub fn generator(params: &[&str], body: Vec<Statement>) -> Self {
        FunctionExpr {
            name: None,
            params: params.iter().map(|p| Pattern::ident(p)).collect(),
            body: Rc::from(body),
            is_async: false,
            is_generator: true,
        }
    }

    pub fn async_generator(params: &[&str], body: Vec<Statement>) -> Self {
        FunctionExpr {
            is_async: true,
            ..Self::generator(params, body)
        }
    }

    pub fn plain(params: &[&str], body: Vec<Statement>) -> Self {
        FunctionExpr {
            is_generator: false,
            ..Self::generator(params, body)
        }
    }

    pub fn async_plain(params: &[&str], body: Vec<Statement>) -> Self {
        FunctionExpr {
            is_async: true,
            is_generator: false,
            ..Self::generator(params, body)
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }
}
