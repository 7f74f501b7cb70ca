pub mod userfaultfd;
