use clap::Parser;
use std::process::ExitCode;
use yieldplan::ast::{
    BinaryOp, Expression as E, FunctionExpr, Statement as S, VarKind,
};
use yieldplan::{Completion, Interpreter};

#[derive(Parser)]
#[command(
    name = "yieldplan",
    version,
    about = "Runs generator programs on compiled resumable plans"
)]
struct Cli {
    /// Demo program to run
    demo: Option<String>,

    /// List the built-in demo programs
    #[arg(long)]
    list: bool,

    /// Print the plans built while running
    #[arg(long = "dump-plan")]
    dump_plan: bool,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_level(true))
        .with(filter)
        .init();
}

struct Demo {
    name: &'static str,
    about: &'static str,
    program: fn() -> Vec<S>,
}

const DEMOS: &[Demo] = &[
    Demo {
        name: "counter",
        about: "a generator counting in a while loop, consumed by for-of",
        program: counter,
    },
    Demo {
        name: "finally",
        about: "breaking out of for-of runs the generator's finally block",
        program: finally,
    },
    Demo {
        name: "delegate",
        about: "yield* through two nested generators",
        program: delegate,
    },
    Demo {
        name: "async",
        about: "an async generator awaiting promises, drained by for await",
        program: async_stream,
    },
    Demo {
        name: "rejected",
        about: "a body the plan builder refuses, surfaced as a SyntaxError",
        program: rejected,
    },
];

fn log(args: Vec<E>) -> S {
    S::expr(E::method_call(E::ident("console"), "log", args))
}

fn counter() -> Vec<S> {
    vec![
        S::const_(
            "count",
            E::function(
                FunctionExpr::generator(
                    &["limit"],
                    vec![
                        S::let_("i", E::num(0.0)),
                        S::while_(
                            E::binary(BinaryOp::Lt, E::ident("i"), E::ident("limit")),
                            vec![S::expr(E::yield_(E::postfix_increment(E::ident("i"))))],
                        ),
                        S::return_(Some(E::string("done"))),
                    ],
                )
                .named("count"),
            ),
        ),
        S::for_of(
            VarKind::Const,
            "n",
            E::call(E::ident("count"), vec![E::num(3.0)]),
            vec![log(vec![E::string("got"), E::ident("n")])],
        ),
    ]
}

fn finally() -> Vec<S> {
    vec![
        S::const_(
            "guarded",
            E::function(
                FunctionExpr::generator(
                    &[],
                    vec![S::try_(
                        vec![
                            S::expr(E::yield_(E::num(1.0))),
                            S::expr(E::yield_(E::num(2.0))),
                        ],
                        None,
                        Some(vec![log(vec![E::string("cleanup")])]),
                    )],
                )
                .named("guarded"),
            ),
        ),
        S::for_of(
            VarKind::Const,
            "v",
            E::call(E::ident("guarded"), vec![]),
            vec![log(vec![E::string("first"), E::ident("v")]), S::break_(None)],
        ),
    ]
}

fn delegate() -> Vec<S> {
    vec![
        S::const_(
            "leaf",
            E::function(
                FunctionExpr::generator(
                    &[],
                    vec![
                        S::expr(E::yield_(E::string("a"))),
                        S::expr(E::yield_(E::string("b"))),
                        S::return_(Some(E::string("leaf done"))),
                    ],
                )
                .named("leaf"),
            ),
        ),
        S::const_(
            "middle",
            E::function(
                FunctionExpr::generator(
                    &[],
                    vec![
                        S::const_("r", E::yield_star(E::call(E::ident("leaf"), vec![]))),
                        S::expr(E::yield_(E::ident("r"))),
                    ],
                )
                .named("middle"),
            ),
        ),
        S::const_(
            "top",
            E::function(
                FunctionExpr::generator(
                    &[],
                    vec![
                        S::expr(E::yield_star(E::call(E::ident("middle"), vec![]))),
                        S::expr(E::yield_star(E::array(vec![E::num(1.0), E::num(2.0)]))),
                    ],
                )
                .named("top"),
            ),
        ),
        S::for_of(
            VarKind::Const,
            "v",
            E::call(E::ident("top"), vec![]),
            vec![log(vec![E::ident("v")])],
        ),
    ]
}

fn async_stream() -> Vec<S> {
    let resolved = |v: E| E::method_call(E::ident("Promise"), "resolve", vec![v]);
    vec![
        S::const_(
            "ticks",
            E::function(
                FunctionExpr::async_generator(
                    &["n"],
                    vec![
                        S::let_("i", E::num(0.0)),
                        S::while_(
                            E::binary(BinaryOp::Lt, E::ident("i"), E::ident("n")),
                            vec![
                                S::const_("v", E::await_(resolved(E::ident("i")))),
                                S::expr(E::yield_(E::binary(
                                    BinaryOp::Mul,
                                    E::ident("v"),
                                    E::num(10.0),
                                ))),
                                S::expr(E::postfix_increment(E::ident("i"))),
                            ],
                        ),
                    ],
                )
                .named("ticks"),
            ),
        ),
        S::const_(
            "main",
            E::function(
                FunctionExpr::async_plain(
                    &[],
                    vec![
                        S::for_await_of(
                            "t",
                            E::call(E::ident("ticks"), vec![E::num(3.0)]),
                            vec![log(vec![E::string("tick"), E::ident("t")])],
                        ),
                        log(vec![E::string("stream finished")]),
                    ],
                )
                .named("main"),
            ),
        ),
        S::expr(E::call(E::ident("main"), vec![])),
        log(vec![E::string("main started")]),
    ]
}

fn rejected() -> Vec<S> {
    vec![S::try_(
        vec![S::const_(
            "pair",
            E::function(
                FunctionExpr::generator(
                    &[],
                    vec![S::expr(E::binary(
                        BinaryOp::Add,
                        E::yield_(E::num(1.0)),
                        E::yield_(E::num(2.0)),
                    ))],
                )
                .named("pair"),
            ),
        )],
        Some((Some("e"), vec![log(vec![E::string("rejected:"), E::ident("e")])])),
        None,
    )]
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if cli.list || cli.demo.is_none() {
        for demo in DEMOS {
            println!("{:<10} {}", demo.name, demo.about);
        }
        return ExitCode::SUCCESS;
    }

    let name = cli.demo.unwrap_or_default();
    let Some(demo) = DEMOS.iter().find(|d| d.name == name) else {
        eprintln!("unknown demo '{name}' (try --list)");
        return ExitCode::from(2);
    };

    let mut interp = Interpreter::new();
    let program = (demo.program)();
    let result = interp.run(&program);
    for line in interp.console_output() {
        println!("{line}");
    }

    if cli.dump_plan {
        for (function, plan) in interp.plans() {
            println!("\nplan for {function}:");
            print!("{plan}");
        }
        let diagnostics = interp.diagnostics();
        println!(
            "\nplans: {} attempted, {} built, {} rejected",
            diagnostics.attempted,
            diagnostics.succeeded,
            diagnostics.failed()
        );
        for failure in &diagnostics.failures {
            println!("  {}: {}", failure.name, failure.reason);
        }
    }

    match result {
        Completion::Throw(e) => {
            eprintln!("Uncaught {}", interp.format_value(&e));
            ExitCode::from(1)
        }
        Completion::Fatal(err) => {
            eprintln!("fatal: {err}");
            ExitCode::from(1)
        }
        _ => ExitCode::SUCCESS,
    }
}
