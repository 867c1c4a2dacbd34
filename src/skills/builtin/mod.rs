pub mod python;

pub use python::PythonInterpreterSkill;
