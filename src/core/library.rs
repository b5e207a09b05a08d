//! Instruction library
//!
//! Merges the built-in persona/framework/linguistic-control libraries
//! shipped in the binary with user-defined entries from the config file.
//! Sessions reference entries by id, never by value, so edits to a custom
//! entry propagate to sessions still pointing at it.

use serde::Deserialize;

use crate::core::config::{Config, Framework, LinguisticControl, Persona};

#[derive(Debug, Deserialize)]
struct BuiltinPersonas {
    personas: Vec<Persona>,
}

#[derive(Debug, Deserialize)]
struct BuiltinFrameworks {
    frameworks: Vec<Framework>,
}

#[derive(Debug, Deserialize)]
struct BuiltinLinguistics {
    linguistic_controls: Vec<LinguisticControl>,
}

pub fn load_builtin_personas() -> Vec<Persona> {
    const CONTENT: &str = include_str!("../builtins/personas.toml");
    let parsed: BuiltinPersonas =
        toml::from_str(CONTENT).expect("Failed to parse builtins/personas.toml");
    parsed.personas
}

pub fn load_builtin_frameworks() -> Vec<Framework> {
    const CONTENT: &str = include_str!("../builtins/frameworks.toml");
    let parsed: BuiltinFrameworks =
        toml::from_str(CONTENT).expect("Failed to parse builtins/frameworks.toml");
    parsed.frameworks
}

pub fn load_builtin_linguistics() -> Vec<LinguisticControl> {
    const CONTENT: &str = include_str!("../builtins/linguistics.toml");
    let parsed: BuiltinLinguistics =
        toml::from_str(CONTENT).expect("Failed to parse builtins/linguistics.toml");
    parsed.linguistic_controls
}

/// Manages the merged instruction library.
pub struct InstructionLibrary {
    personas: Vec<Persona>,
    frameworks: Vec<Framework>,
    linguistics: Vec<LinguisticControl>,
}

impl InstructionLibrary {
    /// Build the library from configuration: built-ins first (unless
    /// disabled), then user-defined custom entries.
    pub fn load(config: &Config) -> Self {
        let mut personas = if config.include_builtins() {
            load_builtin_personas()
        } else {
            Vec::new()
        };
        let mut frameworks = if config.include_builtins() {
            load_builtin_frameworks()
        } else {
            Vec::new()
        };
        let mut linguistics = if config.include_builtins() {
            load_builtin_linguistics()
        } else {
            Vec::new()
        };

        personas.extend(config.personas.iter().cloned());
        frameworks.extend(config.frameworks.iter().cloned());
        linguistics.extend(config.linguistic_controls.iter().cloned());

        Self {
            personas,
            frameworks,
            linguistics,
        }
    }

    pub fn list_personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn list_frameworks(&self) -> &[Framework] {
        &self.frameworks
    }

    pub fn list_linguistics(&self) -> &[LinguisticControl] {
        &self.linguistics
    }

    pub fn find_persona(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn find_framework(&self, id: &str) -> Option<&Framework> {
        self.frameworks.iter().find(|f| f.id == id)
    }

    pub fn find_linguistic(&self, id: &str) -> Option<&LinguisticControl> {
        self.linguistics.iter().find(|l| l.id == id)
    }

    /// Add a user-created persona. The `is_custom` flag is forced on so
    /// library listings can distinguish built-ins from user entries.
    pub fn add_custom_persona(&mut self, mut persona: Persona) -> Result<(), String> {
        if self.find_persona(&persona.id).is_some() {
            return Err(format!("Persona '{}' already exists", persona.id));
        }
        persona.is_custom = true;
        self.personas.push(persona);
        Ok(())
    }

    pub fn add_custom_framework(&mut self, mut framework: Framework) -> Result<(), String> {
        if self.find_framework(&framework.id).is_some() {
            return Err(format!("Framework '{}' already exists", framework.id));
        }
        framework.is_custom = true;
        self.frameworks.push(framework);
        Ok(())
    }

    pub fn add_custom_linguistic(&mut self, mut control: LinguisticControl) -> Result<(), String> {
        if self.find_linguistic(&control.id).is_some() {
            return Err(format!("Linguistic control '{}' already exists", control.id));
        }
        control.is_custom = true;
        self.linguistics.push(control);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_parse_and_have_expected_entries() {
        let personas = load_builtin_personas();
        let ids: Vec<&str> = personas.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&"grand-scholar"));
        assert!(personas.iter().all(|p| !p.is_custom));

        let frameworks = load_builtin_frameworks();
        assert!(frameworks.iter().any(|f| f.id == "first-principles"));

        let linguistics = load_builtin_linguistics();
        assert!(linguistics.iter().any(|l| l.id == "plain-language"));
    }

    #[test]
    fn config_entries_merge_after_builtins() {
        let mut config = Config::default();
        config.personas.push(Persona {
            id: "night-owl".into(),
            name: "Night Owl".into(),
            category: "casual".into(),
            system_prompt: "Terse, nocturnal answers.".into(),
            description: None,
            is_custom: true,
        });

        let library = InstructionLibrary::load(&config);
        assert!(library.find_persona("grand-scholar").is_some());
        assert!(library.find_persona("night-owl").is_some());
    }

    #[test]
    fn disabling_builtins_leaves_only_custom_entries() {
        let mut config = Config::default();
        config.builtin_library = Some(false);
        let library = InstructionLibrary::load(&config);
        assert!(library.list_personas().is_empty());
        assert!(library.list_frameworks().is_empty());
    }

    #[test]
    fn custom_entries_are_flagged_and_deduplicated() {
        let config = Config::default();
        let mut library = InstructionLibrary::load(&config);

        let persona = Persona {
            id: "reviewer".into(),
            name: "Reviewer".into(),
            category: "technical".into(),
            system_prompt: "Review code critically.".into(),
            description: None,
            is_custom: false,
        };
        library.add_custom_persona(persona.clone()).unwrap();
        assert!(library.find_persona("reviewer").unwrap().is_custom);
        assert!(library.add_custom_persona(persona).is_err());
    }
}
