mod tests_build_read;
