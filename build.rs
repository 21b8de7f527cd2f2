//! Build script for datacat that emits git metadata via vergen.

/// Emit the git SHA so `datacat --version` can report the exact build.
///
/// `GIT_SHA` wins when set (release pipelines build from exported trees without a
/// `.git` directory). Otherwise vergen-gitcl asks the local git checkout.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-env-changed=GIT_SHA");
    if let Ok(sha) = std::env::var("GIT_SHA") {
        println!("cargo:rustc-env=VERGEN_GIT_SHA={sha}");
    } else {
        use vergen_gitcl::{Emitter, GitclBuilder};
        let gitcl = GitclBuilder::default().sha(true).build()?;
        Emitter::default().add_instructions(&gitcl)?.emit()?;
    }

    Ok(())
}
