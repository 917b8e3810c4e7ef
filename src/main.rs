fn main() -> Result<(), Box<dyn std::error::Error>> {
    sparkchat::cli::main()
}
