//! Static registry of the fifteen supported languages (C1): display name,
//! toolchain version, source-file suffix, and run recipe. Fixed at build
//! time — `lookup`/`all` are exhaustive matches over [`LanguageId`], the
//! same dispatch idiom used elsewhere in this codebase for closed,
//! build-time-known enums.

use ceb_core::LanguageId;

/// How the broker turns a source file into a running child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunRecipe {
    /// A single interpreter/VM invocation: `program` followed by `args`,
    /// where one arg is the literal placeholder `"{file}"`.
    Direct {
        program: &'static str,
        args: &'static [&'static str],
    },
    /// Compile then run as a shell-joined pipeline. Both commands may
    /// reference `"{file}"`; `run_program`/`run_args` run the compiled
    /// artifact (`compile_output` names the expected output path relative
    /// to the source file's directory).
    CompileThenRun {
        compile_program: &'static str,
        compile_args: &'static [&'static str],
        run_program: &'static str,
        run_args: &'static [&'static str],
    },
}

/// Immutable descriptor for one supported language.
#[derive(Debug, Clone)]
pub struct LanguageDescriptor {
    pub id: LanguageId,
    pub display_name: &'static str,
    pub toolchain_version: &'static str,
    pub source_suffix: &'static str,
    pub recipe: RunRecipe,
    pub default_packages: &'static [&'static str],
}

/// Look up a language's descriptor. Matching is case-sensitive and operates
/// on the already-parsed [`LanguageId`] — there is no free-text lookup.
pub fn lookup(id: LanguageId) -> LanguageDescriptor {
    match id {
        LanguageId::Python => LanguageDescriptor {
            id,
            display_name: "Python",
            toolchain_version: "3.12",
            source_suffix: ".py",
            recipe: RunRecipe::Direct {
                program: "python3",
                args: &["{file}"],
            },
            default_packages: &["requests", "numpy"],
        },
        LanguageId::Javascript => LanguageDescriptor {
            id,
            display_name: "JavaScript",
            toolchain_version: "Node.js 20",
            source_suffix: ".js",
            recipe: RunRecipe::Direct {
                program: "node",
                args: &["{file}"],
            },
            default_packages: &[],
        },
        LanguageId::Typescript => LanguageDescriptor {
            id,
            display_name: "TypeScript",
            toolchain_version: "5.x / Node.js 20",
            source_suffix: ".ts",
            recipe: RunRecipe::Direct {
                program: "npx",
                args: &["--yes", "tsx", "{file}"],
            },
            default_packages: &["typescript", "tsx"],
        },
        LanguageId::Java => LanguageDescriptor {
            id,
            display_name: "Java",
            toolchain_version: "21",
            source_suffix: ".java",
            // `java -cp {dir} {class}` loads the class compiled from the
            // source file; javac requires the public class name to equal
            // the file's base name, so `{class}` (the file stem) is also
            // the main class to run.
            recipe: RunRecipe::CompileThenRun {
                compile_program: "javac",
                compile_args: &["{file}"],
                run_program: "java",
                run_args: &["-cp", "{dir}", "{class}"],
            },
            default_packages: &[],
        },
        LanguageId::C => LanguageDescriptor {
            id,
            display_name: "C",
            toolchain_version: "gcc 13",
            source_suffix: ".c",
            recipe: RunRecipe::CompileThenRun {
                compile_program: "gcc",
                compile_args: &["{file}", "-o", "{file}.out"],
                run_program: "{file}.out",
                run_args: &[],
            },
            default_packages: &[],
        },
        LanguageId::Cpp => LanguageDescriptor {
            id,
            display_name: "C++",
            toolchain_version: "g++ 13",
            source_suffix: ".cpp",
            recipe: RunRecipe::CompileThenRun {
                compile_program: "g++",
                compile_args: &["{file}", "-o", "{file}.out"],
                run_program: "{file}.out",
                run_args: &[],
            },
            default_packages: &[],
        },
        LanguageId::Csharp => LanguageDescriptor {
            id,
            display_name: "C#",
            toolchain_version: "Mono 6 (.NET 8 language surface)",
            source_suffix: ".cs",
            recipe: RunRecipe::CompileThenRun {
                compile_program: "mcs",
                compile_args: &["{file}", "-out:{file}.exe"],
                run_program: "mono",
                run_args: &["{file}.exe"],
            },
            default_packages: &[],
        },
        LanguageId::Rust => LanguageDescriptor {
            id,
            display_name: "Rust",
            toolchain_version: "1.88",
            source_suffix: ".rs",
            recipe: RunRecipe::CompileThenRun {
                compile_program: "rustc",
                compile_args: &["{file}", "-o", "{file}.out"],
                run_program: "{file}.out",
                run_args: &[],
            },
            default_packages: &[],
        },
        LanguageId::Go => LanguageDescriptor {
            id,
            display_name: "Go",
            toolchain_version: "1.22",
            source_suffix: ".go",
            recipe: RunRecipe::Direct {
                program: "go",
                args: &["run", "{file}"],
            },
            default_packages: &[],
        },
        LanguageId::Php => LanguageDescriptor {
            id,
            display_name: "PHP",
            toolchain_version: "8.3",
            source_suffix: ".php",
            recipe: RunRecipe::Direct {
                program: "php",
                args: &["{file}"],
            },
            default_packages: &[],
        },
        LanguageId::Perl => LanguageDescriptor {
            id,
            display_name: "Perl",
            toolchain_version: "5.38",
            source_suffix: ".pl",
            recipe: RunRecipe::Direct {
                program: "perl",
                args: &["{file}"],
            },
            default_packages: &[],
        },
        LanguageId::Ruby => LanguageDescriptor {
            id,
            display_name: "Ruby",
            toolchain_version: "3.3",
            source_suffix: ".rb",
            recipe: RunRecipe::Direct {
                program: "ruby",
                args: &["{file}"],
            },
            default_packages: &[],
        },
        LanguageId::Lua => LanguageDescriptor {
            id,
            display_name: "Lua",
            toolchain_version: "5.4",
            source_suffix: ".lua",
            recipe: RunRecipe::Direct {
                program: "lua",
                args: &["{file}"],
            },
            default_packages: &[],
        },
        LanguageId::Swift => LanguageDescriptor {
            id,
            display_name: "Swift",
            toolchain_version: "5.10",
            source_suffix: ".swift",
            recipe: RunRecipe::CompileThenRun {
                compile_program: "swiftc",
                compile_args: &["{file}", "-o", "{file}.out"],
                run_program: "{file}.out",
                run_args: &[],
            },
            default_packages: &[],
        },
        LanguageId::Objc => LanguageDescriptor {
            id,
            display_name: "Objective-C",
            toolchain_version: "gcc 13 + libobjc2",
            source_suffix: ".m",
            recipe: RunRecipe::CompileThenRun {
                compile_program: "gcc",
                compile_args: &["{file}", "-lobjc", "-o", "{file}.out"],
                run_program: "{file}.out",
                run_args: &[],
            },
            default_packages: &[],
        },
    }
}

/// All fifteen descriptors, in [`LanguageId::ALL`] order.
pub fn all() -> Vec<LanguageDescriptor> {
    LanguageId::ALL.iter().copied().map(lookup).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_returns_fifteen() {
        assert_eq!(all().len(), 15);
    }

    #[test]
    fn test_lookup_matches_id() {
        for lang in LanguageId::ALL {
            assert_eq!(lookup(lang).id, lang);
        }
    }

    #[test]
    fn test_source_suffixes_are_unique() {
        let mut suffixes: Vec<_> = all().iter().map(|d| d.source_suffix).collect();
        suffixes.sort_unstable();
        suffixes.dedup();
        assert_eq!(suffixes.len(), 15);
    }

    #[test]
    fn test_direct_recipes_reference_file_placeholder() {
        for desc in all() {
            if let RunRecipe::Direct { args, .. } = desc.recipe {
                assert!(
                    args.iter().any(|a| a.contains("{file}")),
                    "{} recipe has no {{file}} placeholder",
                    desc.display_name
                );
            }
        }
    }

    #[test]
    fn test_compiled_languages_use_compile_then_run() {
        let compiled = [
            LanguageId::C,
            LanguageId::Cpp,
            LanguageId::Rust,
            LanguageId::Objc,
            LanguageId::Java,
            LanguageId::Csharp,
            LanguageId::Swift,
        ];
        for lang in compiled {
            assert!(matches!(
                lookup(lang).recipe,
                RunRecipe::CompileThenRun { .. }
            ));
        }
    }

    #[test]
    fn test_java_main_class_derived_from_file_stem() {
        match lookup(LanguageId::Java).recipe {
            RunRecipe::CompileThenRun { run_program, run_args, .. } => {
                assert_eq!(run_program, "java");
                assert!(run_args.contains(&"{dir}"));
                assert!(run_args.contains(&"{class}"));
            }
            _ => panic!("expected Java to compile then run"),
        }
    }

    #[test]
    fn test_python_default_packages() {
        let py = lookup(LanguageId::Python);
        assert!(py.default_packages.contains(&"requests"));
    }
}
