use which::which;

/// Building this crate requires `bpf-linker` on the PATH. Fail early with a
/// useful message instead of an opaque linker error.
fn main() {
	if which("bpf-linker").is_err() {
		panic!("bpf-linker not found on PATH; install it with `cargo install bpf-linker`");
	}
}
