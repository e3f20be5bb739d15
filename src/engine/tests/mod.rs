pub mod helpers;
mod tests_write_path;
