mod tests_edit;
mod tests_storage;
