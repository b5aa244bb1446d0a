fn main() {
    // Rerun when the formula grammar changes
    println!("cargo:rerun-if-changed=src/formula.pest");
}
