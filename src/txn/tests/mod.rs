mod tests_optimistic;
mod tests_pessimistic;
