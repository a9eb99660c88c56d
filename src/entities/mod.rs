/// Storefront entities module
pub mod cart;
pub mod cart_item;
pub mod course;
pub mod entitlement;
pub mod user;

// Re-export entities
pub use cart::{CartStatus, Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use course::{Entity as Course, Model as CourseModel};
pub use entitlement::{Entity as Entitlement, Model as EntitlementModel};
pub use user::{Entity as User, Model as UserModel, UserRole};
