pub mod structure_codes;
