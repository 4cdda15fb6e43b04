use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    coachai::cli::main()
}
