//! Isolated compiler invocation.
//!
//! Rewrites a client's compiler command line so it compiles preprocessed
//! source from stdin, runs it (optionally chrooted into an extracted
//! toolchain environment) and collects the files it produced.

pub mod args;
pub mod outputs;
pub mod process;

pub use args::{rewrite, ArgumentError, CompilerKind, Invocation, RewriteOptions};
pub use outputs::{collect_outputs, CollectedOutput};
pub use process::{run, Isolation, ProcessError, ProcessOutput, UserIdentity, ABNORMAL_EXIT_CODE};
